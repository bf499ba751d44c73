//! Owns a rotation run: spawns one worker per slot, stops after the budget, joins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::barrier::RendezvousPair;
use crate::error::{Result, RotationError};
use crate::events::{DEFAULT_EVENT_ROUNDS, EventLog};
use crate::latch::CompletionLatch;
use crate::rotation::RotationState;
use crate::types::{Group, GroupIndex, SlotIndex, TaskAction};
use crate::worker::{Shared, SlotWorker, WorkerExit};

/// Construction parameters for a [`Coordinator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Physical slots, one worker each.
    pub slots: usize,
    /// Logical groups rotated through the slots.
    pub groups: usize,
    /// How long the coordinator lets rounds start before stopping.
    pub duration: Duration,
    /// Optional cap on completed rounds.
    pub round_limit: Option<u64>,
    /// Most recent rounds kept in the event log; zero disables recording.
    pub event_rounds: usize,
}

impl CoordinatorConfig {
    pub fn new(slots: usize, groups: usize, duration: Duration) -> Self {
        Self {
            slots,
            groups,
            duration,
            round_limit: None,
            event_rounds: DEFAULT_EVENT_ROUNDS,
        }
    }

    pub fn with_round_limit(mut self, limit: u64) -> Self {
        self.round_limit = Some(limit);
        self
    }

    pub fn with_event_rounds(mut self, rounds: usize) -> Self {
        self.event_rounds = rounds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(RotationError::invalid("slots", "must be > 0"));
        }
        if self.groups == 0 {
            return Err(RotationError::invalid("groups", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted { reason: String },
}

/// Summary returned by [`Coordinator::start`] once every worker has been joined.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub rounds_completed: u64,
    pub tasks_executed: u64,
    pub task_failures: u64,
    /// Group that would have run next.
    pub final_group: GroupIndex,
    pub elapsed: Duration,
    /// Exit state of each slot worker, indexed by slot.
    pub exits: Vec<WorkerExit>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }

    /// Turn an aborted run into a run-level error.
    pub fn into_result(self) -> Result<RunReport> {
        if let RunStatus::Aborted { reason } = &self.status {
            return Err(RotationError::RunAborted {
                reason: reason.clone(),
                rounds_completed: self.rounds_completed,
            });
        }
        Ok(self)
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl Coordinator {
    /// Build a coordinator over prebuilt groups.
    ///
    /// Every group must hold exactly `config.slots` tasks and appear at its own index.
    pub fn new(config: CoordinatorConfig, groups: Vec<Group>) -> Result<Self> {
        config.validate()?;
        if groups.len() != config.groups {
            return Err(RotationError::invalid(
                "groups",
                format!("expected {} groups, got {}", config.groups, groups.len()),
            ));
        }
        for (index, group) in groups.iter().enumerate() {
            if group.len() != config.slots {
                return Err(RotationError::MalformedGroup {
                    group: index,
                    expected: config.slots,
                    actual: group.len(),
                });
            }
            if group.index() != index {
                return Err(RotationError::invalid(
                    "groups",
                    format!("group {} found at position {index}", group.index()),
                ));
            }
        }

        let rotation = Arc::new(RotationState::new(config.groups, config.round_limit));
        let pair = {
            let rotation = Arc::clone(&rotation);
            RendezvousPair::new(config.slots, move || {
                rotation.advance();
            })
        };
        let shared = Arc::new(Shared {
            slots: config.slots,
            groups,
            rotation,
            pair,
            events: Arc::new(EventLog::new(config.event_rounds)),
            interrupts: (0..config.slots).map(|_| AtomicBool::new(false)).collect(),
            latch: CompletionLatch::new(config.slots),
            tasks_executed: AtomicU64::new(0),
            task_failures: AtomicU64::new(0),
        });
        Ok(Self {
            config,
            shared,
            started: AtomicBool::new(false),
        })
    }

    /// Build `config.groups` groups that all run the same action.
    pub fn uniform(config: CoordinatorConfig, action: TaskAction) -> Result<Self> {
        config.validate()?;
        let groups = (0..config.groups)
            .map(|index| Group::uniform(index, config.slots, Arc::clone(&action)))
            .collect();
        Self::new(config, groups)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run the rotation until the budget elapses, then stop and join every worker.
    ///
    /// Returns early only when no worker is left running (round limit reached or
    /// run aborted). A coordinator runs once; a second call fails.
    pub fn start(&self) -> Result<RunReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RotationError::AlreadyStarted);
        }
        let shared = &self.shared;
        let start = Instant::now();
        // A budget past the end of representable time means "until stopped".
        shared.rotation.arm(start.checked_add(self.config.duration));
        info!(
            slots = self.config.slots,
            groups = self.config.groups,
            duration_ms = millis(self.config.duration),
            round_limit = ?self.config.round_limit,
            "rotation started"
        );

        let mut handles = Vec::with_capacity(shared.slots);
        for slot in 0..shared.slots {
            let worker = SlotWorker::new(slot, Arc::clone(shared));
            let spawned = thread::Builder::new()
                .name(format!("slot-{slot}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Spawned peers would otherwise wait forever for the missing slot.
                    shared.rotation.request_stop();
                    shared.pair.break_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(RotationError::Spawn(err));
                }
            }
        }

        if shared.latch.wait_timeout(self.config.duration) {
            info!("all slot workers exited before the budget elapsed");
        } else {
            info!(running = shared.latch.remaining(), "budget elapsed");
        }
        self.stop();

        let exits: Vec<WorkerExit> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(WorkerExit::Panicked))
            .collect();

        let status = match abort_reason(&exits) {
            Some(reason) => RunStatus::Aborted { reason },
            None => RunStatus::Completed,
        };
        let report = RunReport {
            status,
            rounds_completed: shared.rotation.rounds_completed(),
            tasks_executed: shared.tasks_executed.load(Ordering::Relaxed),
            task_failures: shared.task_failures.load(Ordering::Relaxed),
            final_group: shared.rotation.current_group(),
            elapsed: start.elapsed(),
            exits,
        };
        match &report.status {
            RunStatus::Completed => info!(
                rounds = report.rounds_completed,
                tasks = report.tasks_executed,
                elapsed_ms = millis(report.elapsed),
                "rotation finished"
            ),
            RunStatus::Aborted { reason } => warn!(
                rounds = report.rounds_completed,
                %reason,
                "rotation aborted"
            ),
        }
        Ok(report)
    }

    /// Ask workers to leave at the next round boundary. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.shared.rotation.request_stop() {
            info!("stop requested");
        }
    }

    /// Cancel one worker outside the normal stop path; its peers are released, not stranded.
    pub fn interrupt(&self, slot: SlotIndex) -> Result<()> {
        if slot >= self.shared.slots {
            return Err(RotationError::UnknownSlot {
                slot,
                slots: self.shared.slots,
            });
        }
        warn!(slot, "interrupting slot worker");
        self.shared.interrupts[slot].store(true, Ordering::SeqCst);
        self.shared.pair.wake_all();
        Ok(())
    }

    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.shared.events)
    }

    pub fn current_group(&self) -> GroupIndex {
        self.shared.rotation.current_group()
    }

    pub fn rounds_completed(&self) -> u64 {
        self.shared.rotation.rounds_completed()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.rotation.is_terminated()
    }
}

/// Whole milliseconds, saturating instead of truncating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Root cause of an aborted run: an interrupted or panicked worker wins over the
/// peers it released with a broken barrier.
fn abort_reason(exits: &[WorkerExit]) -> Option<String> {
    let root = exits
        .iter()
        .enumerate()
        .find(|(_, exit)| matches!(exit, WorkerExit::Interrupted { .. } | WorkerExit::Panicked))
        .or_else(|| exits.iter().enumerate().find(|(_, exit)| !exit.is_done()))?;
    let reason = match *root.1 {
        WorkerExit::Interrupted { round } => {
            RotationError::InterruptedWhileRunning { slot: root.0, round }.to_string()
        }
        WorkerExit::Broken { barrier, round } => {
            RotationError::BarrierBroken { barrier, round }.to_string()
        }
        WorkerExit::Panicked => format!("slot {} worker panicked", root.0),
        WorkerExit::Done => return None,
    };
    Some(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Phase;
    use crate::types::{Task, task_action};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn sleeper(ms: u64) -> TaskAction {
        task_action(move |_ctx| {
            thread::sleep(Duration::from_millis(ms));
            Ok(())
        })
    }

    #[test]
    fn zero_budget_runs_no_rounds() {
        let config = CoordinatorConfig::new(1, 3, Duration::ZERO);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        let report = coordinator.start().expect("run");
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.rounds_completed, 0);
        assert!(coordinator.events().is_empty());
    }

    #[test]
    fn budget_covering_two_rounds_runs_six_tasks() {
        // Rounds start at ~0ms and ~200ms; the third would start after the 300ms budget.
        let config = CoordinatorConfig::new(3, 2, Duration::from_millis(300));
        let coordinator = Coordinator::uniform(config, sleeper(200)).expect("valid config");
        let report = coordinator.start().expect("run");

        let events = coordinator.events();
        assert_eq!(report.rounds_completed, 2);
        assert_eq!(events.count(Phase::Start), 6);
        assert_eq!(events.count(Phase::End), 6);
        assert_eq!(events.group_sequence(), vec![0, 1]);
        assert_eq!(report.final_group, 0);
        assert!(events.audit(3, 2).is_clean());
    }

    #[test]
    fn rotation_order_follows_groups_cyclically() {
        let config = CoordinatorConfig::new(4, 5, Duration::from_secs(30)).with_round_limit(12);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        let started = Instant::now();
        let report = coordinator.start().expect("run").into_result().expect("completed");

        // The round limit ends the run long before the budget.
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.rounds_completed, 12);
        assert_eq!(report.tasks_executed, 48);
        let sequence = coordinator.events().group_sequence();
        let expected: Vec<usize> = (0..12).map(|round| round % 5).collect();
        assert_eq!(sequence, expected);
        assert_eq!(report.final_group, 12 % 5);
    }

    #[test]
    fn every_round_runs_one_whole_group() {
        let config = CoordinatorConfig::new(5, 3, Duration::from_secs(30)).with_round_limit(20);
        let action: TaskAction = task_action(|ctx| {
            // Vary the work so slots finish out of order.
            thread::sleep(Duration::from_micros(200 * (ctx.slot as u64 + 1)));
            Ok(())
        });
        let coordinator = Coordinator::uniform(config, action).expect("valid config");
        coordinator.start().expect("run");

        let audit = coordinator.events().audit(5, 3);
        assert!(audit.is_clean(), "{audit:?}");
        assert_eq!(audit.rounds, 20);
    }

    #[test]
    fn stop_returns_after_in_flight_round() {
        let config = CoordinatorConfig::new(3, 2, Duration::from_secs(60));
        let coordinator = Arc::new(Coordinator::uniform(config, sleeper(50)).expect("valid config"));
        let runner = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.start())
        };

        thread::sleep(Duration::from_millis(120));
        let stopped_at = Instant::now();
        coordinator.stop();
        coordinator.stop();
        let report = runner
            .join()
            .expect("runner panicked")
            .expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        // Bounded by the in-flight round, not by the 60s budget.
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
        assert!(report.rounds_completed >= 1);
        assert!(coordinator.events().audit(3, 2).is_clean());
        assert!(report.exits.iter().all(WorkerExit::is_done));
    }

    #[test]
    fn deadline_bounds_run_duration() {
        let budget = Duration::from_millis(200);
        let round = Duration::from_millis(20);
        let config = CoordinatorConfig::new(2, 2, budget);
        let coordinator = Coordinator::uniform(config, sleeper(20)).expect("valid config");
        let report = coordinator.start().expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.elapsed >= budget, "{:?}", report.elapsed);
        // At most one admitted round overruns the budget, plus scheduling slack.
        assert!(
            report.elapsed < budget + round + Duration::from_millis(150),
            "{:?}",
            report.elapsed
        );
        assert!(report.rounds_completed >= 2);
        assert!(coordinator.events().audit(2, 2).is_clean());
    }

    #[test]
    fn unbounded_budget_runs_until_stopped() {
        let config = CoordinatorConfig::new(2, 2, Duration::MAX);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        coordinator.stop();
        let report = coordinator.start().expect("run");
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.rounds_completed, 0);

        let config = CoordinatorConfig::new(2, 3, Duration::MAX).with_round_limit(5);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        let report = coordinator.start().expect("run");
        assert_eq!(report.rounds_completed, 5);
        assert_eq!(report.final_group, 2);
    }

    #[test]
    fn event_log_keeps_configured_rounds() {
        let config = CoordinatorConfig::new(3, 4, Duration::from_secs(30))
            .with_round_limit(10)
            .with_event_rounds(2);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        let report = coordinator.start().expect("run");

        let events = coordinator.events();
        assert_eq!(report.tasks_executed, 30);
        assert_eq!(events.len(), 2 * 2 * 3);
        assert_eq!(events.first_round(), Some(8));
        assert_eq!(events.group_sequence(), vec![0, 1]);
        assert!(events.audit(3, 4).is_clean());
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn stop_before_start_runs_nothing() {
        let config = CoordinatorConfig::new(2, 2, Duration::from_millis(200));
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        coordinator.stop();
        let report = coordinator.start().expect("run");
        assert_eq!(report.rounds_completed, 0);
        assert!(coordinator.events().is_empty());
    }

    #[test]
    fn interrupt_mid_round_aborts_without_hanging() {
        let config = CoordinatorConfig::new(4, 3, Duration::from_secs(60));
        let coordinator = Arc::new(Coordinator::uniform(config, sleeper(150)).expect("valid config"));
        let runner = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.start())
        };

        thread::sleep(Duration::from_millis(50));
        coordinator.interrupt(1).expect("known slot");
        let report = runner
            .join()
            .expect("runner panicked")
            .expect("run");

        assert!(report.is_aborted());
        assert!(matches!(report.exits[1], WorkerExit::Interrupted { round: 0 }));
        for (slot, exit) in report.exits.iter().enumerate() {
            if slot != 1 {
                assert!(matches!(exit, WorkerExit::Broken { barrier: "exit", round: 0 }), "{exit:?}");
            }
        }
        // The interrupted round still ran every task to completion.
        assert!(!coordinator.events().audit(4, 3).atomicity_violation());

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, RotationError::RunAborted { rounds_completed: 0, .. }));
        assert!(err.to_string().contains("slot 1 interrupted"));
    }

    #[test]
    fn failing_task_does_not_block_the_round() {
        let config = CoordinatorConfig::new(3, 2, Duration::from_secs(30)).with_round_limit(4);
        let groups = (0..2)
            .map(|group| {
                let tasks = (0..3)
                    .map(|slot| {
                        let action: TaskAction = if slot == 2 {
                            task_action(|ctx| {
                                if ctx.round % 2 == 0 {
                                    anyhow::bail!("misfire in round {}", ctx.round);
                                }
                                panic!("jammed");
                            })
                        } else {
                            sleeper(1)
                        };
                        Task::new(group, slot, 3, action)
                    })
                    .collect();
                Group::new(group, 3, tasks).expect("well-formed group")
            })
            .collect();
        let coordinator = Coordinator::new(config, groups).expect("valid config");
        let report = coordinator.start().expect("run");

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.rounds_completed, 4);
        assert_eq!(report.tasks_executed, 12);
        assert_eq!(report.task_failures, 4);
        let failed_ends = coordinator
            .events()
            .snapshot()
            .iter()
            .filter(|event| event.phase == Phase::End && event.failed)
            .count();
        assert_eq!(failed_ends, 4);
    }

    #[test]
    fn scratch_is_cleared_before_each_task() {
        let config = CoordinatorConfig::new(2, 3, Duration::from_secs(30)).with_round_limit(6);
        let dirty = Arc::new(AtomicUsize::new(0));
        let action: TaskAction = {
            let dirty = Arc::clone(&dirty);
            task_action(move |ctx| {
                if !ctx.scratch.is_empty() {
                    dirty.fetch_add(1, Ordering::SeqCst);
                }
                ctx.scratch.insert("target".to_string(), ctx.task.to_string());
                Ok(())
            })
        };
        let coordinator = Coordinator::uniform(config, action).expect("valid config");
        coordinator.start().expect("run");
        assert_eq!(dirty.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_observe_their_own_slot_and_group() {
        let config = CoordinatorConfig::new(3, 4, Duration::from_secs(30)).with_round_limit(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let action: TaskAction = {
            let seen = Arc::clone(&seen);
            task_action(move |ctx| {
                let mut guard = seen.lock().expect("seen mutex poisoned");
                guard.push((ctx.round, ctx.group, ctx.slot, ctx.task));
                Ok(())
            })
        };
        let coordinator = Coordinator::uniform(config, action).expect("valid config");
        coordinator.start().expect("run");

        let guard = seen.lock().expect("seen mutex poisoned");
        assert_eq!(guard.len(), 24);
        for &(round, group, slot, task) in guard.iter() {
            assert_eq!(group as u64, round % 4);
            assert_eq!(task, (group * 3 + slot) as u64);
        }
    }

    #[test]
    fn construction_rejects_bad_input() {
        let err = Coordinator::uniform(CoordinatorConfig::new(0, 2, Duration::ZERO), sleeper(1))
            .err()
            .expect("zero slots rejected");
        assert!(matches!(err, RotationError::InvalidConfig { parameter: "slots", .. }));

        let err = Coordinator::uniform(CoordinatorConfig::new(2, 0, Duration::ZERO), sleeper(1))
            .err()
            .expect("zero groups rejected");
        assert!(matches!(err, RotationError::InvalidConfig { parameter: "groups", .. }));

        let groups = vec![Group::uniform(0, 2, sleeper(1)), Group::uniform(1, 3, sleeper(1))];
        let err = Coordinator::new(CoordinatorConfig::new(2, 2, Duration::ZERO), groups)
            .err()
            .expect("malformed group rejected");
        assert!(matches!(
            err,
            RotationError::MalformedGroup {
                group: 1,
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn second_start_and_unknown_slot_fail() {
        let config = CoordinatorConfig::new(2, 2, Duration::ZERO);
        let coordinator = Coordinator::uniform(config, sleeper(1)).expect("valid config");
        coordinator.start().expect("first run");
        assert!(matches!(coordinator.start(), Err(RotationError::AlreadyStarted)));
        assert!(matches!(
            coordinator.interrupt(5),
            Err(RotationError::UnknownSlot { slot: 5, slots: 2 })
        ));
    }
}
