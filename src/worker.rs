//! One persistent worker per slot, looping through rounds in lockstep with its peers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::barrier::{BarrierError, CyclicBarrier, RendezvousPair};
use crate::events::{EventLog, Phase, TaskEvent};
use crate::latch::{CompletionLatch, CountDownOnDrop};
use crate::rotation::RotationState;
use crate::types::{Group, Round, SlotIndex, Task, TaskContext};

/// State shared by the coordinator and every slot worker.
pub(crate) struct Shared {
    pub(crate) slots: usize,
    pub(crate) groups: Vec<Group>,
    pub(crate) rotation: Arc<RotationState>,
    pub(crate) pair: RendezvousPair,
    pub(crate) events: Arc<EventLog>,
    pub(crate) interrupts: Vec<AtomicBool>,
    pub(crate) latch: CompletionLatch,
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) task_failures: AtomicU64,
}

/// How a slot worker left its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Observed `terminated` at a round boundary.
    Done,
    /// Cancelled through its own interrupt flag.
    Interrupted { round: Round },
    /// Released from a barrier because a peer left.
    Broken { barrier: &'static str, round: Round },
    /// The worker thread itself panicked outside a task action.
    Panicked,
}

impl WorkerExit {
    pub fn is_done(&self) -> bool {
        matches!(self, WorkerExit::Done)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Done => f.write_str("done"),
            WorkerExit::Interrupted { round } => write!(f, "interrupted in round {round}"),
            WorkerExit::Broken { barrier, round } => {
                write!(f, "{barrier} barrier broken in round {round}")
            }
            WorkerExit::Panicked => f.write_str("panicked"),
        }
    }
}

pub(crate) struct SlotWorker {
    slot: SlotIndex,
    shared: Arc<Shared>,
    scratch: HashMap<String, String>,
}

impl SlotWorker {
    pub(crate) fn new(slot: SlotIndex, shared: Arc<Shared>) -> Self {
        Self {
            slot,
            shared,
            scratch: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self) -> WorkerExit {
        let shared = Arc::clone(&self.shared);
        let _done = CountDownOnDrop(&shared.latch);
        debug!(slot = self.slot, "slot worker started");

        let exit = panic::catch_unwind(AssertUnwindSafe(|| self.run_rounds()))
            .unwrap_or(WorkerExit::Panicked);
        if !exit.is_done() {
            // Never leave peers one party short.
            shared.pair.break_all();
            warn!(slot = self.slot, %exit, "slot worker aborted");
        } else {
            debug!(slot = self.slot, "slot worker done");
        }
        exit
    }

    fn run_rounds(&mut self) -> WorkerExit {
        let shared = Arc::clone(&self.shared);
        let interrupted = &shared.interrupts[self.slot];
        let mut round: Round = 0;
        loop {
            // WAIT_FOR_ROUND
            if shared.rotation.is_terminated() {
                return WorkerExit::Done;
            }
            if interrupted.load(Ordering::SeqCst) {
                return WorkerExit::Interrupted { round };
            }
            let group = shared.rotation.current_group();
            let task = shared.groups[group].task(self.slot);
            if let Err(err) = shared.pair.entry.wait(interrupted) {
                return barrier_exit(err, &shared.pair.entry, round);
            }

            // USE_RESOURCE
            self.use_resource(task, round);

            // WAIT_FOR_ROTATION
            match shared.pair.exit.wait(interrupted) {
                Ok(arrival) if arrival.is_leader() => {
                    debug!(slot = self.slot, round, group, "closed round");
                }
                Ok(_) => {}
                Err(err) => return barrier_exit(err, &shared.pair.exit, round),
            }
            round += 1;
        }
    }

    fn use_resource(&mut self, task: &Task, round: Round) {
        self.scratch.clear();
        self.emit(Phase::Start, task, round, false);

        let mut ctx = TaskContext {
            task: task.id,
            group: task.group,
            slot: self.slot,
            round,
            scratch: &mut self.scratch,
            interrupted: &self.shared.interrupts[self.slot],
        };
        let failed = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut ctx))) {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                warn!(task = task.id, round, error = %err, "task failed");
                true
            }
            Err(_) => {
                warn!(task = task.id, round, "task panicked");
                true
            }
        };

        self.shared.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.shared.task_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(Phase::End, task, round, failed);
    }

    fn emit(&self, phase: Phase, task: &Task, round: Round, failed: bool) {
        info!(
            phase = phase.as_str(),
            task = task.id,
            group = task.group,
            slot = self.slot,
            round,
            "resource use"
        );
        self.shared.events.record(TaskEvent {
            phase,
            task: task.id,
            group: task.group,
            slot: self.slot,
            round,
            at: Instant::now(),
            failed,
        });
    }
}

fn barrier_exit(err: BarrierError, barrier: &CyclicBarrier, round: Round) -> WorkerExit {
    match err {
        BarrierError::Interrupted => WorkerExit::Interrupted { round },
        BarrierError::Broken => WorkerExit::Broken {
            barrier: barrier.label(),
            round,
        },
    }
}
