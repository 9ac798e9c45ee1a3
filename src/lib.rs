//! WolfMember - Dynamic Membership for WolfScale Consensus Groups
//!
//! Grows and shrinks the voting membership of a Raft-style consensus group
//! while it keeps serving writes.
//!
//! # Architecture
//!
//! The leader diffs its voting set against a target set supplied by
//! discovery. A missing member is first replicated to as a non-voter until
//! it keeps pace with the log tail, then proposed as a voter. A surplus
//! member is proposed out once the group exceeds its expected size. Only
//! one membership change is in flight at a time.
//!
//! # Features
//!
//! - Round-based catch-up tracking against a moving log tail
//! - Copy-on-write membership view with change listeners
//! - Membership followed through log append, commit and truncation
//! - Committed membership persisted to SQLite with checksums
//! - Join-side waiter for "am I a caught-up voter yet"

pub mod config;
pub mod error;
pub mod member;
pub mod clock;
pub mod log;
pub mod membership;
pub mod state;
pub mod replication;

pub use config::WolfMemberConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMemberConfig;
    pub use crate::error::{Error, Result};
    pub use crate::member::{FollowerProgress, FollowerStates, LogIndex, MemberId, Role};
    pub use crate::log::{EntryContent, LogEntry, LogEvent, ReadableLog};
    pub use crate::membership::{MembershipManager, MembershipView, MembershipWaiter};
    pub use crate::state::{MembershipSnapshot, StateStorage};
    pub use crate::replication::{MembershipChangeRecord, Replicator};
}
