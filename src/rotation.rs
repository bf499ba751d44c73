//! Shared rotation record read by every slot worker.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tracing::debug;

use crate::types::GroupIndex;

/// Active group index plus the termination latch.
///
/// `current_group` is written only by [`RotationState::advance`], which runs as the
/// exit barrier's trailing action; the barrier's mutex publishes it to every worker
/// before they are released. `terminated` is likewise latched only at that point (or
/// once before workers start), so all slots agree on whether the next round runs.
pub struct RotationState {
    groups: usize,
    current_group: AtomicUsize,
    terminated: AtomicBool,
    stop_requested: AtomicBool,
    rounds_completed: AtomicU64,
    round_limit: Option<u64>,
    deadline: OnceLock<Instant>,
}

impl RotationState {
    pub fn new(groups: usize, round_limit: Option<u64>) -> Self {
        debug_assert!(groups > 0, "groups must be > 0");
        Self {
            groups,
            current_group: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            rounds_completed: AtomicU64::new(0),
            round_limit,
            deadline: OnceLock::new(),
        }
    }

    pub fn current_group(&self) -> GroupIndex {
        self.current_group.load(Ordering::Acquire)
    }

    /// Whether workers must leave at their next round check.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Record a stop request; returns `true` only for the first caller.
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed.load(Ordering::Acquire)
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Fix the run deadline and latch the decision for the first round.
    ///
    /// `None` runs without a deadline, until a stop request or the round limit.
    pub(crate) fn arm(&self, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            let _ = self.deadline.set(deadline);
        }
        self.latch_termination();
    }

    fn should_halt(&self) -> bool {
        if self.stop_requested() {
            return true;
        }
        if self
            .deadline
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
        {
            return true;
        }
        self.round_limit
            .is_some_and(|limit| self.rounds_completed() >= limit)
    }

    fn latch_termination(&self) -> bool {
        if self.should_halt() {
            self.terminated.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Rotate to the next group and count the finished round.
    ///
    /// Must run exactly once per round; the exit barrier guarantees that.
    pub fn advance(&self) -> GroupIndex {
        let next = (self.current_group() + 1) % self.groups;
        self.current_group.store(next, Ordering::Release);
        let rounds = self.rounds_completed.fetch_add(1, Ordering::AcqRel) + 1;
        let halted = self.latch_termination();
        debug!(next_group = next, rounds, halted, "next turn");
        next
    }
}
