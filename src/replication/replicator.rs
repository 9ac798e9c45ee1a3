//! Membership Change Replication
//!
//! The outbound port through which the manager proposes a new voting set.
//! Submission is non-blocking: the record is handed to the consensus core,
//! which appends it to the log and later reports the append and commit
//! through log events.

use std::collections::BTreeSet;
use std::sync::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::log::EntryContent;
use crate::member::MemberId;

/// Proposal to replace the voting set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChangeRecord {
    pub members: BTreeSet<MemberId>,
}

impl MembershipChangeRecord {
    pub fn new(members: BTreeSet<MemberId>) -> Self {
        Self { members }
    }

    /// Log payload carrying this change
    pub fn into_entry_content(self) -> EntryContent {
        EntryContent::Membership {
            members: self.members,
        }
    }
}

/// Submits membership changes to the replicated log
pub trait Replicator: Send + Sync {
    fn replicate(&self, record: MembershipChangeRecord) -> Result<()>;
}

/// Replicator that hands records to the consensus core over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelReplicator {
    sender: mpsc::Sender<MembershipChangeRecord>,
}

impl ChannelReplicator {
    /// Create a replicator and the receiving end for the consensus core
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MembershipChangeRecord>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl Replicator for ChannelReplicator {
    fn replicate(&self, record: MembershipChangeRecord) -> Result<()> {
        self.sender.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Replication("replication queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::Replication("consensus core is not accepting proposals".into())
            }
        })
    }
}

/// Replicator that records every proposal and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingReplicator {
    records: Mutex<Vec<MembershipChangeRecord>>,
    failing: Mutex<bool>,
}

impl RecordingReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent proposals fail (they are still recorded)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn records(&self) -> Vec<MembershipChangeRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<MembershipChangeRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }
}

impl Replicator for RecordingReplicator {
    fn replicate(&self, record: MembershipChangeRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(Error::Replication("replicator set to fail".into()));
        }
        Ok(())
    }
}
