//! Membership Waiter
//!
//! Join-side observer. A joining node polls until it is a voting member
//! whose commit index has caught up with the leader's. The leader's commit
//! index keeps advancing, so each check compares against the value seen at
//! the previous check rather than the current one.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::member::{LogIndex, MemberId};
use crate::membership::view::MembershipView;

/// Commit indices of the local consensus core
pub trait CommitIndexSource: Send + Sync {
    fn local_commit_index(&self) -> LogIndex;

    /// Commit index last advertised by the leader, `None` while no leader is known
    fn leader_commit_index(&self) -> Option<LogIndex>;
}

/// Commit indices updated by whoever drives the consensus core
#[derive(Debug, Default)]
pub struct SharedCommitIndex {
    inner: Mutex<(LogIndex, Option<LogIndex>)>,
}

impl SharedCommitIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&self, index: LogIndex) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0 = index;
    }

    pub fn set_leader(&self, index: Option<LogIndex>) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1 = index;
    }
}

impl CommitIndexSource for SharedCommitIndex {
    fn local_commit_index(&self) -> LogIndex {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn leader_commit_index(&self) -> Option<LogIndex> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

struct Evaluator {
    myself: MemberId,
    view: Arc<MembershipView>,
    raft: Arc<dyn CommitIndexSource>,
    last_leader_commit: Option<LogIndex>,
}

impl Evaluator {
    fn evaluate(&mut self) -> bool {
        let local_commit = self.raft.local_commit_index();
        let caught_up = self
            .last_leader_commit
            .is_some_and(|leader_commit| local_commit >= leader_commit);
        let is_voter = self.view.voting_members().contains(&self.myself);

        tracing::debug!(
            "Join check for {}: voter={}, local commit {}, previous leader commit {:?}",
            self.myself,
            is_voter,
            local_commit,
            self.last_leader_commit
        );

        self.last_leader_commit = self.raft.leader_commit_index();
        is_voter && caught_up
    }
}

/// Pending wait for the local member to become a caught-up voter
///
/// Resolves to `Err(Error::Cancelled)` if [`cancel`](Self::cancel) was called.
/// Dropping the handle stops the polling task.
pub struct WaitHandle {
    result: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

impl WaitHandle {
    /// Stop polling
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Future for WaitHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Cancelled))
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Lets a joining member wait until it is a caught-up voting member
pub struct MembershipWaiter {
    myself: MemberId,
    view: Arc<MembershipView>,
    raft: Arc<dyn CommitIndexSource>,
    max_catchup_lag: Duration,
}

impl MembershipWaiter {
    pub fn new(
        myself: MemberId,
        view: Arc<MembershipView>,
        raft: Arc<dyn CommitIndexSource>,
        max_catchup_lag: Duration,
    ) -> Self {
        Self {
            myself,
            view,
            raft,
            max_catchup_lag,
        }
    }

    /// Start polling every `max_catchup_lag`
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until_caught_up_member(&self) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        let mut evaluator = Evaluator {
            myself: self.myself.clone(),
            view: Arc::clone(&self.view),
            raft: Arc::clone(&self.raft),
            last_leader_commit: None,
        };
        let period = self.max_catchup_lag;

        let task = tokio::spawn(async move {
            let mut tx = tx;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = tx.closed() => return,
                }

                if evaluator.evaluate() {
                    tracing::info!("{} is now a caught-up voting member", evaluator.myself);
                    let _ = tx.send(());
                    return;
                }
            }
        });

        WaitHandle { result: rx, task }
    }

    /// Wait at most `timeout` for the local member to catch up
    pub async fn wait_with_timeout(&self, timeout: Duration) -> Result<()> {
        let handle = self.wait_until_caught_up_member();
        match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} did not catch up within {:?}", self.myself, timeout);
                Err(Error::JoinTimeout(timeout))
            }
        }
    }
}
