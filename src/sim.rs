//! Demo, single-run, benchmark, and stress runners for the rotation drill.

use std::thread;
use std::time::Duration;

use rotation_drill::{Coordinator, CoordinatorConfig, RunReport, RunStatus, TaskAction, task_action};
use tracing::info;

// Demo knobs: four lanes, five ranks, short enough for quick CLI feedback.
const DEMO_SLOTS: usize = 4;
const DEMO_GROUPS: usize = 5;
const DEMO_DURATION_MS: u64 = 1500;
const DEMO_MAX_PAUSE_MS: u64 = 100;

const BENCH_SLOTS: usize = 4;
const BENCH_GROUPS: usize = 5;
const BENCH_DURATION_MS: u64 = 500;
const BENCH_WORK_MS: u64 = 2;

const CSV_HEADER: &str = "slots,groups,duration_ms,work_ms,rounds,tasks,elapsed_ms,rounds_per_s,cpu_user_s,cpu_sys_s,status,atomicity_violation,rotation_violation";

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; all-zero is a valid value.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// A shooter firing at its lane's target for a random bounded time.
fn fire_action(max_pause_ms: u64) -> TaskAction {
    task_action(move |ctx| {
        let pause = if max_pause_ms == 0 {
            0
        } else {
            rand::random_range(0..=max_pause_ms)
        };
        ctx.scratch.insert("pause_ms".to_string(), pause.to_string());
        thread::sleep(Duration::from_millis(pause));
        Ok(())
    })
}

/// Fixed-length work so benchmark rows are comparable.
fn fixed_work_action(work_ms: u64) -> TaskAction {
    task_action(move |_ctx| {
        if work_ms > 0 {
            thread::sleep(Duration::from_millis(work_ms));
        }
        Ok(())
    })
}

/// Start the coordinator; optionally interrupt slot 0 halfway through the budget.
fn run_coordinator(coordinator: &Coordinator, simulate_interrupt: bool) -> anyhow::Result<RunReport> {
    let halfway = coordinator.config().duration / 2;
    let report = thread::scope(|scope| {
        if simulate_interrupt {
            scope.spawn(move || {
                thread::sleep(halfway);
                if let Err(err) = coordinator.interrupt(0) {
                    tracing::warn!(error = %err, "interrupt injection failed");
                }
            });
        }
        coordinator.start()
    })?;
    Ok(report)
}

fn status_label(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted { .. } => "aborted",
    }
}

fn print_summary(title: &str, coordinator: &Coordinator, report: &RunReport) {
    let config = coordinator.config();
    let events = coordinator.events();
    let audit = events.audit(config.slots, config.groups);
    let sequence = events.group_sequence();

    println!("{title}");
    println!(
        "slots={} groups={} tasks_total={}",
        config.slots,
        config.groups,
        config.slots * config.groups
    );
    println!("rounds_completed={}", report.rounds_completed);
    println!("tasks_executed={}", report.tasks_executed);
    println!("task_failures={}", report.task_failures);
    println!("group_sequence={sequence:?}");
    println!("final_group={}", report.final_group);
    println!("atomicity_violation={}", audit.atomicity_violation());
    println!("rotation_violation={}", audit.rotation_violation());
    println!("elapsed_ms={}", report.elapsed.as_millis());
    println!("status={}", status_label(&report.status));
    if let RunStatus::Aborted { reason } = &report.status {
        println!("abort_reason={reason}");
    }
}

/// Run the default shooting-drill demo.
pub fn run_demo() -> anyhow::Result<()> {
    info!("demo start");
    let config = CoordinatorConfig::new(
        DEMO_SLOTS,
        DEMO_GROUPS,
        Duration::from_millis(DEMO_DURATION_MS),
    );
    let coordinator = Coordinator::uniform(config, fire_action(DEMO_MAX_PAUSE_MS))?;
    let report = coordinator.start()?;
    print_summary("DEMO SUMMARY", &coordinator, &report);
    Ok(())
}

/// Run one configured rotation; an aborted run is reported and returned as an error.
pub fn run_once(
    slots: usize,
    groups: usize,
    duration_ms: u64,
    max_pause_ms: u64,
    round_limit: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = CoordinatorConfig::new(slots, groups, Duration::from_millis(duration_ms));
    if let Some(limit) = round_limit {
        config = config.with_round_limit(limit);
    }
    let coordinator = Coordinator::uniform(config, fire_action(max_pause_ms))?;
    let report = coordinator.start()?;
    print_summary("RUN SUMMARY", &coordinator, &report);
    report.into_result()?;
    Ok(())
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    slots: usize,
    groups: usize,
    duration_ms: u64,
    work_ms: u64,
    rounds: u64,
    tasks: u64,
    elapsed_ms: f64,
    rounds_per_s: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    status: &'static str,
    atomicity_violation: bool,
    rotation_violation: bool,
}

impl BenchResult {
    fn csv_row(&self) -> String {
        let cpu_user = self
            .cpu_user_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        let cpu_sys = self
            .cpu_sys_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        format!(
            "{},{},{},{},{},{},{:.2},{:.2},{},{},{},{},{}",
            self.slots,
            self.groups,
            self.duration_ms,
            self.work_ms,
            self.rounds,
            self.tasks,
            self.elapsed_ms,
            self.rounds_per_s,
            cpu_user,
            cpu_sys,
            self.status,
            self.atomicity_violation,
            self.rotation_violation
        )
    }

    fn report_violations(&self, validate: bool) {
        if !validate {
            return;
        }
        if self.atomicity_violation {
            eprintln!("# violation,group_atomicity");
        }
        if self.rotation_violation {
            eprintln!("# violation,rotation_order");
        }
    }
}

fn benchmark_once(
    config: CoordinatorConfig,
    work_ms: u64,
    simulate_interrupt: bool,
) -> anyhow::Result<BenchResult> {
    let duration_ms = u64::try_from(config.duration.as_millis()).unwrap_or(u64::MAX);
    let coordinator = Coordinator::uniform(config, fixed_work_action(work_ms))?;

    let cpu_start = cpu_times_seconds();
    let report = run_coordinator(&coordinator, simulate_interrupt)?;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    let config = coordinator.config();
    let audit = coordinator.events().audit(config.slots, config.groups);
    let elapsed_ms = report.elapsed.as_secs_f64() * 1000.0;
    let rounds_per_s = if elapsed_ms > 0.0 {
        report.rounds_completed as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };

    Ok(BenchResult {
        slots: config.slots,
        groups: config.groups,
        duration_ms,
        work_ms,
        rounds: report.rounds_completed,
        tasks: report.tasks_executed,
        elapsed_ms,
        rounds_per_s,
        cpu_user_s,
        cpu_sys_s,
        status: status_label(&report.status),
        atomicity_violation: audit.atomicity_violation(),
        rotation_violation: audit.rotation_violation(),
    })
}

/// Run a single benchmark with optional parameter overrides.
pub fn run_benchmark(
    slots: Option<usize>,
    groups: Option<usize>,
    duration_ms: Option<u64>,
    work_ms: Option<u64>,
    validate: bool,
    simulate_interrupt: bool,
) -> anyhow::Result<()> {
    let config = CoordinatorConfig::new(
        slots.unwrap_or(BENCH_SLOTS),
        groups.unwrap_or(BENCH_GROUPS),
        Duration::from_millis(duration_ms.unwrap_or(BENCH_DURATION_MS)),
    );
    config.validate()?;
    let result = benchmark_once(config, work_ms.unwrap_or(BENCH_WORK_MS), simulate_interrupt)?;

    println!("{CSV_HEADER}");
    println!("{}", result.csv_row());
    result.report_violations(validate);
    Ok(())
}

/// Sweep slot/group combinations and print CSV output.
pub fn run_stress(
    slot_sets: Option<Vec<usize>>,
    group_sets: Option<Vec<usize>>,
    duration_ms: Option<u64>,
    work_ms: Option<u64>,
    validate: bool,
    simulate_interrupt: bool,
) -> anyhow::Result<()> {
    let slot_sets = slot_sets.unwrap_or_else(|| vec![1, 2, 4, 8]);
    let group_sets = group_sets.unwrap_or_else(|| vec![1, 3, 5]);
    let duration = Duration::from_millis(duration_ms.unwrap_or(BENCH_DURATION_MS));
    let work_ms = work_ms.unwrap_or(BENCH_WORK_MS);

    // Reject the whole sweep up front rather than failing halfway through the CSV.
    let mut configs = Vec::with_capacity(slot_sets.len() * group_sets.len());
    for &slots in &slot_sets {
        for &groups in &group_sets {
            let config = CoordinatorConfig::new(slots, groups, duration);
            config.validate()?;
            configs.push(config);
        }
    }

    println!("{CSV_HEADER}");
    for config in configs {
        let result = benchmark_once(config, work_ms, simulate_interrupt)?;
        println!("{}", result.csv_row());
        result.report_violations(validate);
    }
    Ok(())
}
