//! Membership State Machine
//!
//! Serializes reconfigurations: at most one member is being caught up or
//! voted in/out at any time, and only `Idle` starts a new one.
//!
//! ```text
//!            BecameLeader                 MissingMember
//!  Inactive ─────────────▶ Idle ─────────────────────────▶ CatchingUp(m)
//!     ▲    (uncommitted     │  ▲ ◀──── failed / abandoned ───────┘ │
//!     │     change in log)  │  │                                   │ goal achieved
//!     │         │           │  └─────── committed / rejected ───┐  ▼
//!     │         └───────────┼─▶ ConsensusInProgress ◀───────────┴──┘
//!     └── LostLeadership ───┘      ▲   SuperfluousMember (from Idle)
//! ```
//!
//! Transitions run `on_exit` for the old state, then `on_entry` for the new
//! one. Side effects go through [`MembershipActions`], which the manager
//! implements.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::member::{FollowerStates, LogIndex, MemberId};
use crate::membership::catchup::CatchupGoalTracker;

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    BecameLeader,
    LostLeadership,
    /// A target member is not a voting member
    MissingMember(MemberId),
    /// A voting member is not in the target and the group is large enough to lose it
    SuperfluousMember(MemberId),
    FollowerStateChange(FollowerStates),
    TargetChanged(BTreeSet<MemberId>),
    /// No membership change is left uncommitted in the log
    RaftGroupCommitted,
    LogTruncated {
        append_index: LogIndex,
        /// The truncation removed the last uncommitted membership change
        dropped_member_change: bool,
    },
    /// Periodic re-evaluation after every manager event
    Tick,
}

/// Side effects available to the state machine
pub trait MembershipActions {
    fn voting_members(&self) -> BTreeSet<MemberId>;

    fn uncommitted_member_change_in_log(&self) -> bool;

    /// Submit a new voting set; false if the replicator rejected it
    fn do_consensus(&mut self, voting: BTreeSet<MemberId>) -> bool;

    fn add_replication_member(&mut self, member: MemberId);

    fn remove_replication_member(&mut self, member: &MemberId);

    fn new_catchup_tracker(&self) -> CatchupGoalTracker;

    fn now(&self) -> Instant;
}

/// State tag without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStateKind {
    Inactive,
    Idle,
    CatchingUp,
    ConsensusInProgress,
}

impl std::fmt::Display for MembershipStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipStateKind::Inactive => write!(f, "INACTIVE"),
            MembershipStateKind::Idle => write!(f, "IDLE"),
            MembershipStateKind::CatchingUp => write!(f, "CATCHING_UP"),
            MembershipStateKind::ConsensusInProgress => write!(f, "CONSENSUS_IN_PROGRESS"),
        }
    }
}

#[derive(Debug)]
enum MembershipState {
    Inactive,
    Idle,
    CatchingUp {
        member: MemberId,
        tracker: CatchupGoalTracker,
        moving_to_consensus: bool,
    },
    ConsensusInProgress {
        /// Member promoted from catch-up, if any
        candidate: Option<MemberId>,
        proposed_at: Instant,
        rejected: bool,
    },
}

impl MembershipState {
    fn kind(&self) -> MembershipStateKind {
        match self {
            MembershipState::Inactive => MembershipStateKind::Inactive,
            MembershipState::Idle => MembershipStateKind::Idle,
            MembershipState::CatchingUp { .. } => MembershipStateKind::CatchingUp,
            MembershipState::ConsensusInProgress { .. } => MembershipStateKind::ConsensusInProgress,
        }
    }
}

/// Four-state reconfiguration automaton
#[derive(Debug)]
pub struct MembershipStateMachine {
    state: MembershipState,
    consensus_timeout: Duration,
}

impl MembershipStateMachine {
    /// Create an inactive state machine
    pub fn new(consensus_timeout: Duration) -> Self {
        Self {
            state: MembershipState::Inactive,
            consensus_timeout,
        }
    }

    pub fn state_kind(&self) -> MembershipStateKind {
        self.state.kind()
    }

    /// Member currently being caught up or promoted
    pub fn candidate(&self) -> Option<&MemberId> {
        match &self.state {
            MembershipState::CatchingUp { member, .. } => Some(member),
            MembershipState::ConsensusInProgress { candidate, .. } => candidate.as_ref(),
            _ => None,
        }
    }

    /// Feed one event through the current state
    pub fn handle<A: MembershipActions>(&mut self, event: MembershipEvent, actions: &mut A) {
        let next = match &mut self.state {
            MembershipState::Inactive => Self::on_inactive(event, actions),
            MembershipState::Idle => Self::on_idle(event, actions),
            MembershipState::CatchingUp {
                member,
                tracker,
                moving_to_consensus,
            } => Self::on_catching_up(event, member, tracker, moving_to_consensus, actions),
            MembershipState::ConsensusInProgress {
                proposed_at,
                rejected,
                ..
            } => Self::on_consensus_in_progress(
                event,
                proposed_at,
                *rejected,
                self.consensus_timeout,
                actions,
            ),
        };

        if let Some(next) = next {
            self.transition(next, actions);
        }
    }

    fn transition<A: MembershipActions>(&mut self, next: MembershipState, actions: &mut A) {
        let previous = std::mem::replace(&mut self.state, next);
        tracing::info!(
            "Membership state {} -> {}",
            previous.kind(),
            self.state.kind()
        );
        Self::on_exit(previous, actions);
        Self::on_entry(&self.state, actions);
    }

    fn on_entry<A: MembershipActions>(state: &MembershipState, actions: &mut A) {
        if let MembershipState::CatchingUp { member, .. } = state {
            actions.add_replication_member(member.clone());
        }
    }

    fn on_exit<A: MembershipActions>(state: MembershipState, actions: &mut A) {
        match state {
            MembershipState::CatchingUp {
                member,
                moving_to_consensus: false,
                ..
            } => actions.remove_replication_member(&member),
            MembershipState::ConsensusInProgress {
                candidate: Some(member),
                ..
            } => actions.remove_replication_member(&member),
            _ => {}
        }
    }

    fn on_inactive<A: MembershipActions>(
        event: MembershipEvent,
        actions: &mut A,
    ) -> Option<MembershipState> {
        match event {
            MembershipEvent::BecameLeader if actions.uncommitted_member_change_in_log() => {
                Some(MembershipState::ConsensusInProgress {
                    candidate: None,
                    proposed_at: actions.now(),
                    rejected: false,
                })
            }
            MembershipEvent::BecameLeader => Some(MembershipState::Idle),
            _ => None,
        }
    }

    fn on_idle<A: MembershipActions>(
        event: MembershipEvent,
        actions: &mut A,
    ) -> Option<MembershipState> {
        match event {
            MembershipEvent::LostLeadership => Some(MembershipState::Inactive),
            MembershipEvent::MissingMember(member) => {
                if actions.uncommitted_member_change_in_log() {
                    tracing::debug!("Not catching up {}: membership change still uncommitted", member);
                    return None;
                }
                tracing::info!("Catching up new member {}", member);
                Some(MembershipState::CatchingUp {
                    member,
                    tracker: actions.new_catchup_tracker(),
                    moving_to_consensus: false,
                })
            }
            MembershipEvent::SuperfluousMember(member) => {
                if actions.uncommitted_member_change_in_log() {
                    tracing::debug!("Not removing {}: membership change still uncommitted", member);
                    return None;
                }
                let mut voting = actions.voting_members();
                voting.remove(&member);
                tracing::info!("Proposing removal of {}", member);
                let accepted = actions.do_consensus(voting);
                Some(MembershipState::ConsensusInProgress {
                    candidate: None,
                    proposed_at: actions.now(),
                    rejected: !accepted,
                })
            }
            _ => None,
        }
    }

    fn on_catching_up<A: MembershipActions>(
        event: MembershipEvent,
        member: &MemberId,
        tracker: &mut CatchupGoalTracker,
        moving_to_consensus: &mut bool,
        actions: &mut A,
    ) -> Option<MembershipState> {
        match event {
            MembershipEvent::LostLeadership => Some(MembershipState::Inactive),
            MembershipEvent::TargetChanged(target) if !target.contains(member) => {
                tracing::info!("Abandoning catch-up of {}: no longer in target", member);
                Some(MembershipState::Idle)
            }
            MembershipEvent::FollowerStateChange(states) => {
                // an unreported candidate has replicated nothing
                let match_index = states.get(member).map_or(0, |p| p.match_index);
                tracker.update_progress(match_index);
                Self::evaluate_catchup(member, tracker, moving_to_consensus, actions)
            }
            MembershipEvent::Tick => {
                tracker.check_timeout();
                Self::evaluate_catchup(member, tracker, moving_to_consensus, actions)
            }
            MembershipEvent::LogTruncated { append_index, .. } => {
                tracker.clamp_target(append_index);
                None
            }
            _ => None,
        }
    }

    fn evaluate_catchup<A: MembershipActions>(
        member: &MemberId,
        tracker: &CatchupGoalTracker,
        moving_to_consensus: &mut bool,
        actions: &mut A,
    ) -> Option<MembershipState> {
        if !tracker.is_finished() {
            return None;
        }

        if !tracker.is_goal_achieved() {
            tracing::info!(
                "Member {} failed to catch up after {} round(s)",
                member,
                tracker.round_count()
            );
            return Some(MembershipState::Idle);
        }

        if actions.uncommitted_member_change_in_log() {
            tracing::debug!("Deferring promotion of {}: membership change still uncommitted", member);
            return None;
        }

        let mut voting = actions.voting_members();
        voting.insert(member.clone());
        tracing::info!("Member {} caught up, proposing it as a voter", member);
        let accepted = actions.do_consensus(voting);
        *moving_to_consensus = true;
        Some(MembershipState::ConsensusInProgress {
            candidate: Some(member.clone()),
            proposed_at: actions.now(),
            rejected: !accepted,
        })
    }

    fn on_consensus_in_progress<A: MembershipActions>(
        event: MembershipEvent,
        proposed_at: &mut Instant,
        rejected: bool,
        consensus_timeout: Duration,
        actions: &mut A,
    ) -> Option<MembershipState> {
        match event {
            MembershipEvent::LostLeadership => Some(MembershipState::Inactive),
            MembershipEvent::RaftGroupCommitted => Some(MembershipState::Idle),
            MembershipEvent::LogTruncated {
                dropped_member_change: true,
                ..
            } if !actions.uncommitted_member_change_in_log() => {
                tracing::info!("Membership proposal was truncated from the log");
                Some(MembershipState::Idle)
            }
            MembershipEvent::Tick => {
                if actions.uncommitted_member_change_in_log() {
                    return None;
                }
                if rejected {
                    tracing::warn!("Membership proposal was rejected, returning to idle");
                    return Some(MembershipState::Idle);
                }
                // an accepted proposal may still be appended, so never propose a second one
                let now = actions.now();
                if now.duration_since(*proposed_at) > consensus_timeout {
                    tracing::warn!(
                        "Membership proposal not seen in the log after {:?}, still waiting",
                        consensus_timeout
                    );
                    *proposed_at = now;
                }
                None
            }
            _ => None,
        }
    }
}
