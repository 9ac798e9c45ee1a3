//! Member Identity and Roles
//!
//! Opaque member identities, the local node's consensus role, and the
//! per-follower replication progress reported by the consensus core.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log
pub type LogIndex = u64;

/// Opaque identity of a cluster member
///
/// The string form is whatever the discovery layer hands out (typically a
/// node id or an advertised address). Ordering is only used to make the
/// choice between several missing or superfluous members deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identity
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Role of the local node in the consensus group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Node is the group leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node is a candidate (during election)
    Candidate,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Replication progress of a single follower, as seen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FollowerProgress {
    /// Highest log index known to be replicated on the follower
    pub match_index: LogIndex,
}

impl FollowerProgress {
    pub fn new(match_index: LogIndex) -> Self {
        Self { match_index }
    }
}

/// Progress of every follower the leader replicates to
pub type FollowerStates = HashMap<MemberId, FollowerProgress>;

/// Build a member set from anything that yields member-like values
pub fn member_set<I, T>(members: I) -> std::collections::BTreeSet<MemberId>
where
    I: IntoIterator<Item = T>,
    T: Into<MemberId>,
{
    members.into_iter().map(Into::into).collect()
}
