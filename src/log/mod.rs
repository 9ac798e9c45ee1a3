//! Replicated Log Module
//!
//! Read access to the consensus log and the event stream the consensus
//! core emits while appending, committing and truncating it.

pub mod entry;
mod memory;

pub use entry::{EntryContent, LogEntry, LogEvent};
pub use memory::InMemoryLog;

use crate::error::Result;
use crate::member::LogIndex;

/// Read-only view of the replicated log
///
/// Indices are 1-based. An empty log has `append_index() == 0`.
pub trait ReadableLog: Send + Sync {
    /// Index of the last appended entry
    fn append_index(&self) -> LogIndex;

    /// Highest index known to be committed
    fn commit_index(&self) -> LogIndex;

    /// Index just before the first readable entry (non-zero once pruned)
    fn prev_index(&self) -> LogIndex;

    /// Read the entry at `index`
    fn read_entry(&self, index: LogIndex) -> Result<LogEntry>;
}
