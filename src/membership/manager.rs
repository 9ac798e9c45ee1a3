//! Membership Manager
//!
//! Glue between the consensus core and the reconfiguration state machine.
//! The manager follows membership-change entries through the log (optimistic
//! on append, durable on commit, recomputed on truncation), diffs the voting
//! set against the externally supplied target, and proposes changes through
//! the [`Replicator`].
//!
//! All event handlers take `&mut self` and are meant to be driven by the
//! consensus core's single event loop. Concurrent readers go through the
//! shared [`MembershipView`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use crate::clock::Clock;
use crate::config::MembershipConfig;
use crate::error::Result;
use crate::log::{LogEntry, LogEvent, ReadableLog};
use crate::member::{FollowerStates, LogIndex, MemberId, Role};
use crate::membership::catchup::CatchupGoalTracker;
use crate::membership::machine::{
    MembershipActions, MembershipEvent, MembershipStateKind, MembershipStateMachine,
};
use crate::membership::view::{ListenerId, MembershipListener, MembershipView};
use crate::replication::{MembershipChangeRecord, Replicator};
use crate::state::{MembershipSnapshot, StateStorage};

/// Everything the state machine acts on
struct ManagerCore {
    myself: MemberId,
    config: MembershipConfig,
    log: Arc<dyn ReadableLog>,
    replicator: Arc<dyn Replicator>,
    storage: Box<dyn StateStorage>,
    clock: Arc<dyn Clock>,
    view: Arc<MembershipView>,
    /// Last committed membership, as persisted
    persisted: MembershipSnapshot,
    /// Appended but not yet committed membership changes
    uncommitted: BTreeMap<LogIndex, BTreeSet<MemberId>>,
    target: Option<BTreeSet<MemberId>>,
    role: Role,
}

impl ManagerCore {
    fn persist(&mut self, snapshot: MembershipSnapshot) -> Result<()> {
        self.storage.persist_store_data(&snapshot)?;
        tracing::debug!(
            "Persisted membership {:?} at index {}",
            snapshot.voting_members,
            snapshot.log_index
        );
        self.persisted = snapshot;
        Ok(())
    }

    /// Newest uncommitted change if any, else the committed set
    fn publish_voting(&self) {
        let voting = self
            .uncommitted
            .values()
            .next_back()
            .cloned()
            .unwrap_or_else(|| self.persisted.voting_members.clone());
        self.view.set_voting_members(voting);
    }

    fn on_append(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if let Some(members) = entry.members() {
                if entry.index > self.persisted.log_index {
                    tracing::info!(
                        "Membership change appended at index {}: {:?}",
                        entry.index,
                        members
                    );
                    self.uncommitted.insert(entry.index, members.clone());
                }
            }
        }
        self.publish_voting();
    }

    /// Returns true when this commit left no membership change uncommitted
    fn on_commit(&mut self, commit_index: LogIndex) -> Result<bool> {
        let still_uncommitted = self.uncommitted.split_off(&(commit_index + 1));
        let committed = std::mem::replace(&mut self.uncommitted, still_uncommitted);

        let Some((index, members)) = committed.into_iter().next_back() else {
            return Ok(false);
        };

        tracing::info!("Membership change committed at index {}: {:?}", index, members);
        self.persist(MembershipSnapshot::new(members, index))?;
        self.publish_voting();
        Ok(self.uncommitted.is_empty())
    }

    /// Returns true when the truncation removed the last uncommitted change
    fn on_truncate(&mut self, from_index: LogIndex) -> Result<bool> {
        let had_uncommitted = !self.uncommitted.is_empty();
        self.reconcile_with_log()?;
        let snapshot = self.persisted.clone();
        self.persist(snapshot)?;

        tracing::info!(
            "Log truncated from index {}, voting members now {:?} ({} uncommitted change(s))",
            from_index,
            self.view.voting_members(),
            self.uncommitted.len()
        );
        Ok(had_uncommitted && self.uncommitted.is_empty())
    }

    /// Rebuild committed and uncommitted membership from the log itself
    fn reconcile_with_log(&mut self) -> Result<()> {
        let append_index = self.log.append_index();
        let commit_index = self.log.commit_index().min(append_index);
        let first = self.log.prev_index() + 1;

        // newest committed change not yet persisted (crash between commit and persist)
        let floor = first.max(self.persisted.log_index + 1);
        for index in (floor..=commit_index).rev() {
            let entry = self.log.read_entry(index)?;
            if let Some(members) = entry.members() {
                self.persist(MembershipSnapshot::new(members.clone(), index))?;
                break;
            }
        }

        self.uncommitted.clear();
        let start = first
            .max(commit_index + 1)
            .max(self.persisted.log_index + 1);
        for index in start..=append_index {
            let entry = self.log.read_entry(index)?;
            if let Some(members) = entry.members() {
                self.uncommitted.insert(index, members.clone());
            }
        }

        self.publish_voting();
        Ok(())
    }

    fn missing_members(&self) -> BTreeSet<MemberId> {
        let voting = self.view.voting_members();
        match &self.target {
            Some(target) => target.difference(&voting).cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Voting members outside the target, never including ourselves
    fn superfluous_members(&self) -> BTreeSet<MemberId> {
        let voting = self.view.voting_members();
        match &self.target {
            Some(target) => voting
                .difference(target)
                .filter(|m| **m != self.myself)
                .cloned()
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn is_safe_to_remove_member(&self) -> bool {
        self.view.voting_members().len() > self.config.expected_cluster_size
    }
}

impl MembershipActions for ManagerCore {
    fn voting_members(&self) -> BTreeSet<MemberId> {
        self.view.voting_members()
    }

    fn uncommitted_member_change_in_log(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    fn do_consensus(&mut self, voting: BTreeSet<MemberId>) -> bool {
        match self
            .replicator
            .replicate(MembershipChangeRecord::new(voting.clone()))
        {
            Ok(()) => {
                tracing::info!("Proposed voting members {:?}", voting);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to propose voting members {:?}: {}", voting, e);
                false
            }
        }
    }

    fn add_replication_member(&mut self, member: MemberId) {
        self.view.add_additional_replication_member(member);
    }

    fn remove_replication_member(&mut self, member: &MemberId) {
        self.view.remove_additional_replication_member(member);
    }

    fn new_catchup_tracker(&self) -> CatchupGoalTracker {
        CatchupGoalTracker::new(
            self.log.clone(),
            self.clock.clone(),
            self.config.catchup_round_timeout(),
            self.config.catchup_timeout(),
        )
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

/// Drives dynamic membership reconfiguration for one consensus group member
pub struct MembershipManager {
    state_machine: MembershipStateMachine,
    core: ManagerCore,
}

impl MembershipManager {
    /// Load persisted membership and reconcile it with the log
    pub fn new(
        myself: MemberId,
        config: MembershipConfig,
        log: Arc<dyn ReadableLog>,
        replicator: Arc<dyn Replicator>,
        storage: Box<dyn StateStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let persisted = storage.get_initial_state()?;
        let view = Arc::new(MembershipView::new(persisted.voting_members.clone()));

        let mut core = ManagerCore {
            myself,
            config: config.clone(),
            log,
            replicator,
            storage,
            clock,
            view,
            persisted,
            uncommitted: BTreeMap::new(),
            target: None,
            role: Role::Follower,
        };
        core.reconcile_with_log()?;

        tracing::info!(
            "Membership manager for {} started: voting {:?} at index {}, {} uncommitted change(s)",
            core.myself,
            core.view.voting_members(),
            core.persisted.log_index,
            core.uncommitted.len()
        );

        Ok(Self {
            state_machine: MembershipStateMachine::new(config.consensus_timeout()),
            core,
        })
    }

    /// Apply log notifications, in log order
    pub fn process_log_events(&mut self, events: &[LogEvent]) -> Result<()> {
        for event in events {
            match event {
                LogEvent::Appended { entries } => self.core.on_append(entries),
                LogEvent::Committed { index } => {
                    if self.core.on_commit(*index)? {
                        self.handle(MembershipEvent::RaftGroupCommitted);
                    }
                }
                LogEvent::Truncated { from_index } => {
                    let dropped_member_change = self.core.on_truncate(*from_index)?;
                    self.handle(MembershipEvent::LogTruncated {
                        append_index: self.core.log.append_index(),
                        dropped_member_change,
                    });
                }
            }
        }
        self.check_for_start_condition();
        Ok(())
    }

    /// Replication progress reported by the leader's replication fan-out
    pub fn on_follower_state_change(&mut self, states: FollowerStates) {
        self.handle(MembershipEvent::FollowerStateChange(states));
        self.handle(MembershipEvent::Tick);
    }

    /// Local role changed
    pub fn on_role(&mut self, role: Role) {
        let was_leader = self.core.role == Role::Leader;
        self.core.role = role;

        match (was_leader, role == Role::Leader) {
            (false, true) => self.handle(MembershipEvent::BecameLeader),
            (true, false) => self.handle(MembershipEvent::LostLeadership),
            _ => {}
        }
        self.check_for_start_condition();
    }

    /// Desired voting membership, as supplied by discovery
    pub fn set_target_membership_set(&mut self, target: BTreeSet<MemberId>) {
        tracing::debug!("Target membership set to {:?}", target);
        self.core.target = Some(target.clone());
        self.handle(MembershipEvent::TargetChanged(target));
        self.check_for_start_condition();
    }

    /// Re-evaluate stalled work, then raise the next missing or superfluous member
    fn check_for_start_condition(&mut self) {
        self.handle(MembershipEvent::Tick);

        if let Some(member) = self.core.missing_members().into_iter().next() {
            self.handle(MembershipEvent::MissingMember(member));
        } else if self.core.is_safe_to_remove_member() {
            if let Some(member) = self.core.superfluous_members().into_iter().next() {
                self.handle(MembershipEvent::SuperfluousMember(member));
            }
        }
    }

    fn handle(&mut self, event: MembershipEvent) {
        self.state_machine.handle(event, &mut self.core);
    }

    pub fn voting_members(&self) -> BTreeSet<MemberId> {
        self.core.view.voting_members()
    }

    pub fn replication_members(&self) -> BTreeSet<MemberId> {
        self.core.view.replication_members()
    }

    /// Log index of the last committed membership change (0 if none)
    pub fn log_index(&self) -> LogIndex {
        self.core.persisted.log_index
    }

    pub fn uncommitted_member_changes(&self) -> usize {
        self.core.uncommitted.len()
    }

    pub fn state(&self) -> MembershipStateKind {
        self.state_machine.state_kind()
    }

    pub fn target_members(&self) -> Option<&BTreeSet<MemberId>> {
        self.core.target.as_ref()
    }

    /// Shared view for concurrent readers
    pub fn view(&self) -> Arc<MembershipView> {
        self.core.view.clone()
    }

    pub fn register_listener(&self, listener: Arc<dyn MembershipListener>) -> ListenerId {
        self.core.view.register_listener(listener)
    }

    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        self.core.view.deregister_listener(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use crate::clock::ManualClock;
    use crate::log::{EntryContent, InMemoryLog};
    use crate::member::{member_set, FollowerProgress};
    use crate::membership::catchup::MAX_ROUNDS;
    use crate::membership::view::MembershipSets;
    use crate::replication::RecordingReplicator;
    use crate::state::InMemoryStateStorage;

    fn config(expected_cluster_size: usize) -> MembershipConfig {
        MembershipConfig {
            expected_cluster_size,
            catchup_round_timeout_ms: 100,
            catchup_timeout_ms: 10_000,
            consensus_timeout_ms: 1_000,
        }
    }

    /// Plays the consensus core around a manager
    struct Harness {
        log: Arc<InMemoryLog>,
        clock: Arc<ManualClock>,
        replicator: Arc<RecordingReplicator>,
        manager: MembershipManager,
        delivered: usize,
        failing: bool,
        /// Accepted proposals not yet appended
        pending: Vec<MembershipChangeRecord>,
    }

    impl Harness {
        /// Log holding one committed membership entry followed by no-ops up to `append_index`
        fn new(voting: &[&str], expected_cluster_size: usize, append_index: LogIndex) -> Self {
            let log = Arc::new(InMemoryLog::new());
            log.append(EntryContent::Membership {
                members: member_set(voting.iter().copied()),
            });
            log.append_all(vec![EntryContent::Noop; (append_index - 1) as usize]);
            log.commit(append_index);
            Self::with_log(log, Box::new(InMemoryStateStorage::new()), expected_cluster_size)
        }

        fn with_log(
            log: Arc<InMemoryLog>,
            storage: Box<dyn StateStorage>,
            expected_cluster_size: usize,
        ) -> Self {
            let clock = Arc::new(ManualClock::new());
            let replicator = Arc::new(RecordingReplicator::new());
            let manager = MembershipManager::new(
                "a".into(),
                config(expected_cluster_size),
                log.clone(),
                replicator.clone(),
                storage,
                clock.clone(),
            )
            .unwrap();
            Self {
                log,
                clock,
                replicator,
                manager,
                delivered: 0,
                failing: false,
                pending: Vec::new(),
            }
        }

        fn set_failing(&mut self, failing: bool) {
            self.failing = failing;
            self.replicator.set_failing(failing);
        }

        /// Queue the proposals the replicator accepted since the last call
        fn collect_proposals(&mut self) {
            let records = self.replicator.records();
            if !self.failing {
                self.pending
                    .extend(records.iter().skip(self.delivered).cloned());
            }
            self.delivered = records.len();
        }

        /// Append every accepted proposal to the log and report the append
        fn deliver_proposals(&mut self) {
            self.collect_proposals();
            for record in std::mem::take(&mut self.pending) {
                let event = self.log.append(record.into_entry_content());
                self.manager.process_log_events(&[event]).unwrap();
            }
        }

        fn commit_all(&mut self) {
            let event = self.log.commit(self.log.append_index());
            self.manager.process_log_events(&[event]).unwrap();
        }

        /// Membership entries between the commit index and the tail
        fn uncommitted_in_log(&self) -> usize {
            (self.log.commit_index() + 1..=self.log.append_index())
                .filter(|i| self.log.read_entry(*i).unwrap().is_membership_change())
                .count()
        }

        fn progress(&mut self, member: &str, match_index: LogIndex) {
            let mut states = FollowerStates::new();
            states.insert(member.into(), FollowerProgress::new(match_index));
            self.manager.on_follower_state_change(states);
        }
    }

    #[test]
    fn test_recovers_committed_membership_from_log() {
        let harness = Harness::new(&["a", "b"], 3, 5);
        assert_eq!(harness.manager.voting_members(), member_set(["a", "b"]));
        assert_eq!(harness.manager.log_index(), 1);
        assert_eq!(harness.manager.uncommitted_member_changes(), 0);
        assert_eq!(harness.manager.state(), MembershipStateKind::Inactive);
    }

    #[test]
    fn test_add_member_after_catch_up() {
        let mut h = Harness::new(&["a", "b"], 3, 10);
        h.manager.on_role(Role::Leader);
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);

        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);
        assert_eq!(h.manager.replication_members(), member_set(["a", "b", "c"]));
        assert_eq!(h.manager.voting_members(), member_set(["a", "b"]));

        h.clock.advance(Duration::from_millis(40));
        h.progress("c", 10);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);
        assert_eq!(
            h.replicator.last().unwrap().members,
            member_set(["a", "b", "c"])
        );

        h.deliver_proposals();
        assert_eq!(h.manager.uncommitted_member_changes(), 1);
        // visible before it is durable
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c"]));
        assert_eq!(h.manager.log_index(), 1);

        h.commit_all();
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert_eq!(h.manager.uncommitted_member_changes(), 0);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c"]));
        assert_eq!(h.manager.replication_members(), member_set(["a", "b", "c"]));
        assert_eq!(h.manager.log_index(), 11);
        assert_eq!(h.replicator.records().len(), 1);
    }

    #[test]
    fn test_catch_up_round_budget_exhausted() {
        let mut h = Harness::new(&["a", "b"], 3, 10);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));

        for _ in 0..MAX_ROUNDS {
            h.clock.advance(Duration::from_millis(150));
            let target = h.log.append_index();
            h.log.append_all(vec![EntryContent::Noop; 4]);
            h.progress("c", target);
        }

        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert_eq!(h.manager.replication_members(), member_set(["a", "b"]));
        assert!(h.replicator.records().is_empty());
    }

    #[test]
    fn test_catch_up_overall_timeout() {
        let mut h = Harness::new(&["a", "b"], 3, 10);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));

        h.clock.advance(Duration::from_secs(11));
        h.progress("c", 3);

        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert_eq!(h.manager.replication_members(), member_set(["a", "b"]));

        // next log event re-triggers the attempt
        let event = h.log.append(EntryContent::Data(vec![1]));
        h.manager.process_log_events(&[event]).unwrap();
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);
    }

    #[test]
    fn test_remove_superfluous_member_without_catch_up() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));

        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);
        assert_eq!(
            h.replicator.records(),
            vec![MembershipChangeRecord::new(member_set(["a", "b", "c"]))]
        );

        h.deliver_proposals();
        h.commit_all();
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c"]));
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
    }

    #[test]
    fn test_no_removal_at_expected_cluster_size() {
        let mut h = Harness::new(&["a", "b", "c"], 3, 4);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b"]));

        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert!(h.replicator.records().is_empty());
    }

    #[test]
    fn test_leader_never_removes_itself() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["b", "c", "d"]));

        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert!(h.replicator.records().is_empty());
    }

    #[test]
    fn test_no_target_means_no_reconfiguration() {
        let mut h = Harness::new(&["a", "b", "c", "d", "e"], 3, 4);
        h.manager.on_role(Role::Leader);
        assert!(h.manager.target_members().is_none());
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert!(h.replicator.records().is_empty());
    }

    #[test]
    fn test_truncation_reverts_uncommitted_change() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        h.deliver_proposals();
        assert_eq!(h.manager.uncommitted_member_changes(), 1);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c"]));

        let event = h.log.truncate(5);
        h.manager.on_role(Role::Follower);
        h.manager.process_log_events(&[event]).unwrap();

        assert_eq!(h.manager.uncommitted_member_changes(), 0);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c", "d"]));
        assert_eq!(h.manager.log_index(), 1);
        assert_eq!(h.manager.state(), MembershipStateKind::Inactive);
    }

    #[test]
    fn test_truncation_without_committed_membership_empties_voting_set() {
        let log = Arc::new(InMemoryLog::new());
        log.append(EntryContent::Noop);
        log.append(EntryContent::Membership {
            members: member_set(["a", "b"]),
        });
        log.commit(1);

        let mut h = Harness::with_log(log, Box::new(InMemoryStateStorage::new()), 3);
        assert_eq!(h.manager.uncommitted_member_changes(), 1);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b"]));

        let event = h.log.truncate(2);
        h.manager.process_log_events(&[event]).unwrap();
        assert_eq!(h.manager.uncommitted_member_changes(), 0);
        assert!(h.manager.voting_members().is_empty());
        assert_eq!(h.manager.log_index(), 0);
    }

    #[test]
    fn test_truncation_during_consensus_returns_leader_to_idle() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c", "d"]));
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        h.deliver_proposals();
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);

        // keep the target satisfied so nothing restarts after truncation
        h.manager.set_target_membership_set(member_set(["a", "b", "c", "d"]));
        let event = h.log.truncate(5);
        h.manager.process_log_events(&[event]).unwrap();
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c", "d"]));
    }

    #[test]
    fn test_resumes_uncommitted_change_after_becoming_leader() {
        let log = Arc::new(InMemoryLog::new());
        log.append(EntryContent::Membership {
            members: member_set(["a", "b", "c"]),
        });
        log.commit(1);
        log.append(EntryContent::Membership {
            members: member_set(["a", "b", "c", "d"]),
        });

        let mut h = Harness::with_log(log, Box::new(InMemoryStateStorage::new()), 3);
        h.manager.on_role(Role::Leader);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);

        // a new target cannot start anything while the old change is in flight
        h.manager.set_target_membership_set(member_set(["a", "b", "c", "d", "e"]));
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);
        assert!(h.replicator.records().is_empty());

        h.commit_all();
        assert_eq!(h.manager.log_index(), 2);
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);
    }

    #[test]
    fn test_replication_failure_is_retried_on_next_event() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        h.set_failing(true);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        h.deliver_proposals();
        assert_eq!(h.replicator.records().len(), 1);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);
        assert_eq!(h.manager.uncommitted_member_changes(), 0);

        h.set_failing(false);
        let event = h.log.append(EntryContent::Noop);
        h.manager.process_log_events(&[event]).unwrap();
        assert_eq!(h.replicator.records().len(), 2);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);

        // the successful proposal is not abandoned while it sits in the log
        h.deliver_proposals();
        h.clock.advance(Duration::from_secs(5));
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        assert_eq!(h.replicator.records().len(), 2);
    }

    #[test]
    fn test_late_append_does_not_cause_second_proposal() {
        let mut h = Harness::new(&["a", "b", "c", "d", "e"], 3, 5);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        assert_eq!(h.replicator.records().len(), 1);
        h.collect_proposals();

        // accepted but still queued past the consensus timeout
        h.clock.advance(Duration::from_secs(2));
        let event = h.log.append(EntryContent::Noop);
        h.manager.process_log_events(&[event]).unwrap();
        h.progress("b", 6);
        assert_eq!(h.replicator.records().len(), 1);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);

        h.deliver_proposals();
        assert_eq!(h.manager.uncommitted_member_changes(), 1);
        assert_eq!(h.uncommitted_in_log(), 1);

        // the next removal only starts once the first one commits
        h.commit_all();
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c", "e"]));
        assert_eq!(h.replicator.records().len(), 2);
        h.deliver_proposals();
        assert!(h.manager.uncommitted_member_changes() <= 1);
        h.commit_all();
        assert_eq!(h.manager.voting_members(), member_set(["a", "b", "c"]));
    }

    #[test]
    fn test_unreported_candidate_gives_up_catch_up() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 10);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c", "d", "e"]));
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);

        // replication fan-out never hears from e
        h.clock.advance(Duration::from_secs(5));
        h.progress("b", 10);
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);

        h.clock.advance(Duration::from_secs(6));
        h.progress("b", 10);
        assert_eq!(h.manager.state(), MembershipStateKind::Idle);
        assert_eq!(h.manager.replication_members(), member_set(["a", "b", "c", "d"]));
    }

    #[test]
    fn test_silent_candidate_is_retried_with_fresh_rounds() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 10);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c", "d", "e"]));
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);

        // no progress reports at all; the next log event gives up and re-raises e
        h.clock.advance(Duration::from_secs(11));
        let event = h.log.append(EntryContent::Noop);
        h.manager.process_log_events(&[event]).unwrap();
        assert_eq!(h.manager.state(), MembershipStateKind::CatchingUp);

        h.clock.advance(Duration::from_millis(50));
        h.progress("e", 11);
        assert_eq!(h.manager.state(), MembershipStateKind::ConsensusInProgress);
        assert_eq!(
            h.replicator.last().unwrap().members,
            member_set(["a", "b", "c", "d", "e"])
        );
    }

    #[test]
    fn test_role_loss_drops_catching_up_candidate() {
        let mut h = Harness::new(&["a", "b"], 3, 10);
        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        assert_eq!(h.manager.replication_members(), member_set(["a", "b", "c"]));

        h.manager.on_role(Role::Candidate);
        assert_eq!(h.manager.state(), MembershipStateKind::Inactive);
        assert_eq!(h.manager.replication_members(), member_set(["a", "b"]));
    }

    #[test]
    fn test_bootstrap_snapshot_then_commit() {
        let log = Arc::new(InMemoryLog::new());
        let storage = InMemoryStateStorage::with_snapshot(MembershipSnapshot::new(
            member_set(["a", "b"]),
            0,
        ));
        let mut h = Harness::with_log(log, Box::new(storage), 1);
        assert_eq!(h.manager.voting_members(), member_set(["a", "b"]));

        let event = h.log.append(EntryContent::Membership {
            members: member_set(["a"]),
        });
        h.manager.process_log_events(&[event]).unwrap();
        h.commit_all();

        assert_eq!(h.manager.log_index(), 1);
        assert_eq!(h.manager.voting_members(), member_set(["a"]));
    }

    #[test]
    fn test_replayed_entries_are_ignored() {
        let log = Arc::new(InMemoryLog::new());
        log.append(EntryContent::Membership {
            members: member_set(["a", "b"]),
        });
        log.commit(1);
        let storage = InMemoryStateStorage::with_snapshot(MembershipSnapshot::new(
            member_set(["a", "b"]),
            1,
        ));
        let mut h = Harness::with_log(log, Box::new(storage), 3);

        let replay = LogEvent::Appended {
            entries: vec![LogEntry::new(
                1,
                1,
                EntryContent::Membership {
                    members: member_set(["a", "b"]),
                },
            )],
        };
        h.manager
            .process_log_events(&[replay, LogEvent::Committed { index: 1 }])
            .unwrap();
        assert_eq!(h.manager.uncommitted_member_changes(), 0);
        assert_eq!(h.manager.log_index(), 1);
    }

    #[test]
    fn test_listeners_see_committed_membership() {
        let mut h = Harness::new(&["a", "b", "c", "d"], 3, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = h.manager.register_listener(Arc::new(move |_: &MembershipSets| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        h.manager.on_role(Role::Leader);
        h.manager.set_target_membership_set(member_set(["a", "b", "c"]));
        h.deliver_proposals();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(h.manager.deregister_listener(id));
        h.commit_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_flight_under_random_events() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut h = Harness::new(&["a", "b", "c"], 3, 5);
        let pool = ["a", "b", "c", "d", "e", "f"];

        for _ in 0..2_000 {
            let proposals_before = h.replicator.records().len();

            match rng.gen_range(0..8) {
                0 => {
                    let role = if rng.gen_bool(0.8) {
                        Role::Leader
                    } else {
                        Role::Follower
                    };
                    // a deposed leader's queued proposals never reach the log
                    if role != Role::Leader {
                        h.pending.clear();
                    }
                    h.manager.on_role(role);
                }
                1 => {
                    let mut target: BTreeSet<MemberId> = pool
                        .iter()
                        .filter(|_| rng.gen_bool(0.6))
                        .map(|m| MemberId::from(*m))
                        .collect();
                    target.insert("a".into());
                    h.manager.set_target_membership_set(target);
                }
                2 => {
                    let member = pool[rng.gen_range(0..pool.len())];
                    let lag = rng.gen_range(0..3);
                    let index = h.log.append_index().saturating_sub(lag);
                    h.progress(member, index);
                }
                3 => {
                    let event = h.log.append(EntryContent::Data(vec![0]));
                    h.manager.process_log_events(&[event]).unwrap();
                }
                4 => h.commit_all(),
                5 => {
                    let commit = h.log.commit_index();
                    let tail = h.log.append_index();
                    if tail > commit {
                        let from = rng.gen_range(commit + 1..=tail);
                        let event = h.log.truncate(from);
                        h.manager.process_log_events(&[event]).unwrap();
                    }
                }
                6 => h.clock.advance(Duration::from_millis(rng.gen_range(0..400))),
                _ => {
                    let failing = rng.gen_bool(0.2);
                    h.set_failing(failing);
                }
            }

            // log mutations above all happen before the manager call
            if h.replicator.records().len() > proposals_before {
                assert_eq!(h.uncommitted_in_log(), 0, "proposal issued with a change in the log");
                assert!(h.pending.is_empty(), "proposal issued with a change still queued");
                assert_eq!(h.replicator.records().len(), proposals_before + 1);
            }

            // deliver now or hold accepted proposals back for a while
            h.collect_proposals();
            if rng.gen_bool(0.6) {
                h.deliver_proposals();
            }
            assert!(h.manager.uncommitted_member_changes() <= 1);
            assert_eq!(h.manager.uncommitted_member_changes(), h.uncommitted_in_log());
        }
    }
}
