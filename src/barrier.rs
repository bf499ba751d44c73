//! Reusable cyclic barriers with a trailing action and break-on-interrupt.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, warn};

/// Runs once per rendezvous, by the last arriver, before anyone is released.
pub type TrailingAction = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    /// Another party left, or the trailing action panicked.
    #[error("barrier broken")]
    Broken,
    /// The caller's own interrupt flag was raised.
    #[error("interrupted while waiting at barrier")]
    Interrupted,
}

/// Outcome of a successful rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    is_leader: bool,
}

impl BarrierWaitResult {
    /// True for exactly one party per generation: the one that completed it.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

pub struct CyclicBarrier {
    label: &'static str,
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    trailing: Option<TrailingAction>,
}

impl CyclicBarrier {
    /// Create a barrier that trips once `parties` callers have arrived.
    ///
    /// # Panics
    /// Panics if `parties == 0`.
    pub fn new(label: &'static str, parties: usize) -> Self {
        assert!(parties > 0, "barrier requires at least 1 party");
        Self {
            label,
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            released: Condvar::new(),
            trailing: None,
        }
    }

    pub fn with_trailing_action(
        label: &'static str,
        parties: usize,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let mut barrier = Self::new(label, parties);
        barrier.trailing = Some(Box::new(action));
        barrier
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().expect("barrier mutex poisoned")
    }

    /// Mark the current generation broken and release every waiter.
    fn trip_broken(&self, state: &mut BarrierState) {
        if !state.broken {
            debug!(barrier = self.label, generation = state.generation, "barrier broken");
        }
        state.broken = true;
        state.arrived = 0;
        self.released.notify_all();
    }

    /// Block until all parties arrive, the barrier breaks, or `interrupted` is raised.
    ///
    /// An interrupted caller breaks the barrier on its way out, so peers waiting
    /// on the same generation leave with [`BarrierError::Broken`] instead of hanging.
    pub fn wait(&self, interrupted: &AtomicBool) -> Result<BarrierWaitResult, BarrierError> {
        let mut state = self.lock();
        if state.broken {
            return Err(BarrierError::Broken);
        }
        if interrupted.load(Ordering::SeqCst) {
            self.trip_broken(&mut state);
            return Err(BarrierError::Interrupted);
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            if let Some(action) = &self.trailing {
                // The guard stays outside the unwind boundary, so a panicking
                // action leaves the mutex unpoisoned.
                if panic::catch_unwind(AssertUnwindSafe(|| action())).is_err() {
                    warn!(barrier = self.label, "trailing action panicked");
                    self.trip_broken(&mut state);
                    return Err(BarrierError::Broken);
                }
            }
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(BarrierWaitResult { is_leader: true });
        }

        loop {
            // Wait releases the lock and re-acquires it before returning.
            state = self.released.wait(state).expect("barrier condvar wait failed");
            if state.generation != generation {
                return Ok(BarrierWaitResult { is_leader: false });
            }
            if state.broken {
                return Err(BarrierError::Broken);
            }
            if interrupted.load(Ordering::SeqCst) {
                self.trip_broken(&mut state);
                return Err(BarrierError::Interrupted);
            }
        }
    }

    /// Break the barrier from outside; current and future waiters fail fast.
    pub fn break_barrier(&self) {
        let mut state = self.lock();
        self.trip_broken(&mut state);
    }

    /// Wake waiters so they re-check their interrupt flags.
    pub fn wake_waiters(&self) {
        let _guard = self.lock();
        self.released.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        self.lock().broken
    }

    #[cfg(test)]
    pub(crate) fn parties(&self) -> usize {
        self.parties
    }

    /// Number of completed rendezvous.
    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// The two rendezvous points of a round.
pub struct RendezvousPair {
    /// All slots start using the resource together.
    pub entry: CyclicBarrier,
    /// All slots finish before rotation; carries the rotation advance.
    pub exit: CyclicBarrier,
}

impl RendezvousPair {
    pub fn new(parties: usize, advance: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            entry: CyclicBarrier::new("entry", parties),
            exit: CyclicBarrier::with_trailing_action("exit", parties, advance),
        }
    }

    pub fn break_all(&self) {
        self.entry.break_barrier();
        self.exit.break_barrier();
    }

    pub fn wake_all(&self) {
        self.entry.wake_waiters();
        self.exit.wake_waiters();
    }

    pub fn is_broken(&self) -> bool {
        self.entry.is_broken() || self.exit.is_broken()
    }
}
