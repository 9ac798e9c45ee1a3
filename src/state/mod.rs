//! State Management Module
//!
//! Persistence of the last committed voting membership.

mod snapshot;
mod storage;

pub use snapshot::MembershipSnapshot;
pub use storage::{InMemoryStateStorage, SqliteStateStorage, StateStorage};
