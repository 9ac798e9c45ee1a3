//! Replication Module
//!
//! Hands membership-change proposals to the consensus core.

mod replicator;

pub use replicator::{ChannelReplicator, MembershipChangeRecord, RecordingReplicator, Replicator};
