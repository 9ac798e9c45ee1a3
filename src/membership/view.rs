//! Membership View
//!
//! The voting set and the replication set (voting members plus at most one
//! catching-up candidate). Every update builds a fresh immutable
//! [`MembershipSets`] and publishes it through a `watch` channel, so readers
//! only ever clone an `Arc` and never observe a half-applied change.
//! Listeners run after publication, outside any lock, and a failing or
//! panicking listener cannot affect the published state or other listeners.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::error::Result;
use crate::member::MemberId;

/// Immutable snapshot of the published membership sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSets {
    /// Members whose acknowledgements count towards quorum
    pub voting: BTreeSet<MemberId>,
    /// Non-voting members receiving entries while they catch up
    pub additional: BTreeSet<MemberId>,
    /// `voting ∪ additional`
    pub replication: BTreeSet<MemberId>,
}

impl MembershipSets {
    fn new(voting: BTreeSet<MemberId>, additional: BTreeSet<MemberId>) -> Self {
        let replication = voting.union(&additional).cloned().collect();
        Self {
            voting,
            additional,
            replication,
        }
    }
}

/// Callback invoked whenever the published membership changes
pub trait MembershipListener: Send + Sync {
    fn on_membership_changed(&self, sets: &MembershipSets) -> Result<()>;
}

impl<F> MembershipListener for F
where
    F: Fn(&MembershipSets) -> Result<()> + Send + Sync,
{
    fn on_membership_changed(&self, sets: &MembershipSets) -> Result<()> {
        self(sets)
    }
}

/// Handle returned by [`MembershipView::register_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Copy-on-write holder of the current membership sets
pub struct MembershipView {
    sets: watch::Sender<Arc<MembershipSets>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn MembershipListener>)>>,
    next_listener_id: AtomicU64,
}

impl MembershipView {
    /// Create a view with the given voting members and no candidates
    pub fn new(voting: BTreeSet<MemberId>) -> Self {
        let (sets, _) = watch::channel(Arc::new(MembershipSets::new(voting, BTreeSet::new())));
        Self {
            sets,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Current snapshot of all sets
    pub fn snapshot(&self) -> Arc<MembershipSets> {
        self.sets.borrow().clone()
    }

    pub fn voting_members(&self) -> BTreeSet<MemberId> {
        self.sets.borrow().voting.clone()
    }

    pub fn replication_members(&self) -> BTreeSet<MemberId> {
        self.sets.borrow().replication.clone()
    }

    pub fn additional_replication_members(&self) -> BTreeSet<MemberId> {
        self.sets.borrow().additional.clone()
    }

    /// Replace the voting set
    pub fn set_voting_members(&self, voting: BTreeSet<MemberId>) {
        self.update(|sets| {
            if sets.voting == voting {
                return None;
            }
            Some(MembershipSets::new(voting, sets.additional.clone()))
        });
    }

    /// Start replicating to a non-voting candidate
    pub fn add_additional_replication_member(&self, member: MemberId) {
        self.update(|sets| {
            if sets.additional.contains(&member) {
                return None;
            }
            let mut additional = sets.additional.clone();
            additional.insert(member);
            Some(MembershipSets::new(sets.voting.clone(), additional))
        });
    }

    /// Stop replicating to a non-voting candidate
    pub fn remove_additional_replication_member(&self, member: &MemberId) {
        self.update(|sets| {
            if !sets.additional.contains(member) {
                return None;
            }
            let mut additional = sets.additional.clone();
            additional.remove(member);
            Some(MembershipSets::new(sets.voting.clone(), additional))
        });
    }

    /// Subscribe to published snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipSets>> {
        self.sets.subscribe()
    }

    pub fn register_listener(&self, listener: Arc<dyn MembershipListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Returns false if the listener was not registered
    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Publish a new snapshot built from the current one, then notify
    fn update<F>(&self, build: F)
    where
        F: FnOnce(&MembershipSets) -> Option<MembershipSets>,
    {
        let mut published = None;
        self.sets.send_if_modified(|current| match build(current) {
            Some(next) => {
                let next = Arc::new(next);
                *current = next.clone();
                published = Some(next);
                true
            }
            None => false,
        });

        if let Some(sets) = published {
            self.notify_listeners(&sets);
        }
    }

    fn notify_listeners(&self, sets: &MembershipSets) {
        let listeners: Vec<(ListenerId, Arc<dyn MembershipListener>)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_membership_changed(sets))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Membership listener {:?} failed: {}", id, e);
                }
                Err(_) => {
                    tracing::warn!("Membership listener {:?} panicked", id);
                }
            }
        }
    }
}

impl std::fmt::Debug for MembershipView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipView")
            .field("sets", &*self.sets.borrow())
            .finish()
    }
}
