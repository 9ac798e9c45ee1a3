//! Membership Reconfiguration Module
//!
//! Grows and shrinks the voting set of a consensus group one member at a
//! time. New members are caught up as non-voting replicas before they are
//! proposed as voters; surplus members are proposed out once the group is
//! larger than its expected size.

pub mod catchup;
pub mod view;
pub mod machine;
mod manager;
mod waiter;

pub use catchup::{CatchupGoalTracker, MAX_ROUNDS};
pub use view::{ListenerId, MembershipListener, MembershipSets, MembershipView};
pub use machine::{MembershipActions, MembershipEvent, MembershipStateKind, MembershipStateMachine};
pub use manager::MembershipManager;
pub use waiter::{CommitIndexSource, MembershipWaiter, SharedCommitIndex, WaitHandle};
