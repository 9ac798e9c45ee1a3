//! Persisted Membership Snapshot

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::member::{LogIndex, MemberId};

/// Last committed voting set and the log index of the entry that carried it
///
/// `log_index == 0` means no membership entry has ever been committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub voting_members: BTreeSet<MemberId>,
    pub log_index: LogIndex,
}

impl MembershipSnapshot {
    pub fn new(voting_members: BTreeSet<MemberId>, log_index: LogIndex) -> Self {
        Self {
            voting_members,
            log_index,
        }
    }

    /// Encode as `crc32 (4 bytes, LE) || bincode body`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode and verify bytes produced by [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::StateCorrupted(format!(
                "snapshot too short: {} bytes",
                bytes.len()
            )));
        }
        let (checksum, body) = bytes.split_at(4);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        let computed = crc32fast::hash(body);
        if expected != computed {
            return Err(Error::StateCorrupted(format!(
                "snapshot checksum mismatch: stored {:08x}, computed {:08x}",
                expected, computed
            )));
        }
        Ok(bincode::deserialize(body)?)
    }
}
