//! Replicated Log Entry Types
//!
//! The subset of the consensus log the membership subsystem cares about:
//! entries are either membership changes or opaque application data.

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use crate::member::{LogIndex, MemberId};

/// Payload of a replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryContent {
    /// New voting member set
    Membership { members: BTreeSet<MemberId> },
    /// Application payload, opaque to membership handling
    Data(Vec<u8>),
    /// Leader no-op written at the start of a term
    Noop,
}

/// A single entry of the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: u64,
    pub content: EntryContent,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(index: LogIndex, term: u64, content: EntryContent) -> Self {
        Self { index, term, content }
    }

    /// Whether this entry carries a membership change
    pub fn is_membership_change(&self) -> bool {
        matches!(self.content, EntryContent::Membership { .. })
    }

    /// The voting set encoded by a membership-change entry
    pub fn members(&self) -> Option<&BTreeSet<MemberId>> {
        match &self.content {
            EntryContent::Membership { members } => Some(members),
            _ => None,
        }
    }

    /// Serialize entry to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize entry from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Notification from the consensus core about a change to the log
///
/// Events must be delivered in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Entries appended to the tail of the log
    Appended { entries: Vec<LogEntry> },
    /// Commit index advanced to `index`
    Committed { index: LogIndex },
    /// Every entry at or after `from_index` was removed
    Truncated { from_index: LogIndex },
}
