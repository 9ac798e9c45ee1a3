//! Catch-up Goal Tracking
//!
//! Decides whether a candidate member replicates fast enough to be trusted
//! with a vote. The log tail keeps moving under write load, so instead of one
//! fixed target the tracker runs up to [`MAX_ROUNDS`] rounds, each chasing the
//! append index observed when the round started. The candidate passes when it
//! reaches a round's target within `round_timeout` of that round starting. The
//! tracker fails closed when the rounds run out or `catchup_timeout` elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::log::ReadableLog;
use crate::member::LogIndex;

/// Maximum number of catch-up rounds before giving up
pub const MAX_ROUNDS: u32 = 10;

/// Round-based catch-up evaluator for a single candidate
pub struct CatchupGoalTracker {
    log: Arc<dyn ReadableLog>,
    clock: Arc<dyn Clock>,
    round_timeout: Duration,
    catchup_timeout: Duration,
    target_index: LogIndex,
    start_time: Instant,
    round_start_time: Instant,
    round_count: u32,
    finished: bool,
    goal_achieved: bool,
}

impl CatchupGoalTracker {
    /// Start tracking against the current append index
    pub fn new(
        log: Arc<dyn ReadableLog>,
        clock: Arc<dyn Clock>,
        round_timeout: Duration,
        catchup_timeout: Duration,
    ) -> Self {
        let now = clock.now();
        let target_index = log.append_index();
        Self {
            log,
            clock,
            round_timeout,
            catchup_timeout,
            target_index,
            start_time: now,
            round_start_time: now,
            round_count: 1,
            finished: false,
            goal_achieved: false,
        }
    }

    /// Feed the candidate's latest match index
    pub fn update_progress(&mut self, match_index: LogIndex) {
        if self.finished {
            return;
        }

        let now = self.clock.now();
        let achieved = match_index >= self.target_index;

        if achieved && now.duration_since(self.round_start_time) <= self.round_timeout {
            self.finished = true;
            self.goal_achieved = true;
        } else if now.duration_since(self.start_time) > self.catchup_timeout {
            self.finished = true;
        } else if achieved && self.round_count < MAX_ROUNDS {
            self.round_count += 1;
            self.round_start_time = now;
            self.target_index = self.log.append_index();
            tracing::trace!(
                "Catch-up round {} started, chasing index {}",
                self.round_count,
                self.target_index
            );
        } else if achieved {
            self.finished = true;
        }
    }

    /// Fail once the overall budget is spent, even without progress reports
    pub fn check_timeout(&mut self) {
        if !self.finished && self.clock.now().duration_since(self.start_time) > self.catchup_timeout {
            tracing::trace!("Catch-up gave up after {:?} without reaching the goal", self.catchup_timeout);
            self.finished = true;
        }
    }

    /// Pull the target back to `append_index` after the log was truncated
    pub fn clamp_target(&mut self, append_index: LogIndex) {
        if self.target_index > append_index {
            self.target_index = append_index;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_goal_achieved(&self) -> bool {
        self.goal_achieved
    }

    pub fn round_count(&self) -> u32 {
        self.round_count
    }

    pub fn target_index(&self) -> LogIndex {
        self.target_index
    }
}

impl std::fmt::Debug for CatchupGoalTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchupGoalTracker")
            .field("target_index", &self.target_index)
            .field("round_count", &self.round_count)
            .field("finished", &self.finished)
            .field("goal_achieved", &self.goal_achieved)
            .finish()
    }
}
