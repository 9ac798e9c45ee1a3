//! In-Memory Log
//!
//! A [`ReadableLog`] kept entirely in memory. Each mutator returns the
//! [`LogEvent`] the consensus core would emit, so callers can forward it
//! to the membership manager.

use std::sync::RwLock;

use super::entry::{EntryContent, LogEntry, LogEvent};
use super::ReadableLog;
use crate::error::{Error, Result};
use crate::member::LogIndex;

struct LogInner {
    /// Entries after `prev_index`, in index order
    entries: Vec<LogEntry>,
    prev_index: LogIndex,
    commit_index: LogIndex,
    term: u64,
}

impl LogInner {
    fn append_index(&self) -> LogIndex {
        self.prev_index + self.entries.len() as LogIndex
    }
}

/// In-memory replicated log
pub struct InMemoryLog {
    inner: RwLock<LogInner>,
}

impl InMemoryLog {
    /// Create an empty log at term 1
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LogInner {
                entries: Vec::new(),
                prev_index: 0,
                commit_index: 0,
                term: 1,
            }),
        }
    }

    /// Set the term stamped on subsequently appended entries
    pub fn set_term(&self, term: u64) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).term = term;
    }

    /// Append one entry at the tail
    pub fn append(&self, content: EntryContent) -> LogEvent {
        self.append_all(vec![content])
    }

    /// Append several entries at the tail as one batch
    pub fn append_all(&self, contents: Vec<EntryContent>) -> LogEvent {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut appended = Vec::with_capacity(contents.len());
        for content in contents {
            let entry = LogEntry::new(inner.append_index() + 1, inner.term, content);
            inner.entries.push(entry.clone());
            appended.push(entry);
        }
        LogEvent::Appended { entries: appended }
    }

    /// Advance the commit index (never moves backwards, never past the tail)
    pub fn commit(&self, index: LogIndex) -> LogEvent {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let index = index.min(inner.append_index());
        if index > inner.commit_index {
            inner.commit_index = index;
        }
        LogEvent::Committed {
            index: inner.commit_index,
        }
    }

    /// Remove every entry at or after `from_index`
    ///
    /// Panics if that would remove committed entries.
    pub fn truncate(&self, from_index: LogIndex) -> LogEvent {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        assert!(
            from_index > inner.commit_index,
            "cannot truncate committed entries (from {} <= commit {})",
            from_index,
            inner.commit_index
        );
        let keep = from_index.saturating_sub(inner.prev_index + 1) as usize;
        inner.entries.truncate(keep);
        LogEvent::Truncated { from_index }
    }

    /// Drop committed entries up to and including `up_to`
    pub fn prune(&self, up_to: LogIndex) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let up_to = up_to.min(inner.commit_index);
        if up_to <= inner.prev_index {
            return;
        }
        let drop = (up_to - inner.prev_index) as usize;
        inner.entries.drain(..drop);
        inner.prev_index = up_to;
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadableLog for InMemoryLog {
    fn append_index(&self) -> LogIndex {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).append_index()
    }

    fn commit_index(&self) -> LogIndex {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).commit_index
    }

    fn prev_index(&self) -> LogIndex {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).prev_index
    }

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if index <= inner.prev_index || index > inner.append_index() {
            return Err(Error::LogIndexOutOfRange {
                index,
                first: inner.prev_index + 1,
                last: inner.append_index(),
            });
        }
        Ok(inner.entries[(index - inner.prev_index - 1) as usize].clone())
    }
}
