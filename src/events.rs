//! Task start/end records and post-run audit of round invariants.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use crate::types::{GroupIndex, Round, SlotIndex, TaskId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    End,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::End => "end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed edge of a task's resource use.
#[derive(Clone, Debug)]
pub struct TaskEvent {
    pub phase: Phase,
    pub task: TaskId,
    pub group: GroupIndex,
    pub slot: SlotIndex,
    pub round: Round,
    pub at: Instant,
    /// Only meaningful for `End`: the action returned an error or panicked.
    pub failed: bool,
}

/// Rounds kept by [`EventLog::default`].
pub const DEFAULT_EVENT_ROUNDS: usize = 256;

/// Record of the most recent rounds, shared by all slot workers.
///
/// Holds at most `max_rounds` rounds; recording a newer round evicts the oldest
/// whole round. Rounds arrive in order because the barriers separate them.
pub struct EventLog {
    max_rounds: usize,
    inner: Mutex<Retained>,
}

#[derive(Default)]
struct Retained {
    events: VecDeque<TaskEvent>,
    /// Highest round dropped so far.
    evicted_through: Option<Round>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_ROUNDS)
    }
}

impl EventLog {
    /// `max_rounds == 0` disables recording.
    pub fn new(max_rounds: usize) -> Self {
        Self {
            max_rounds,
            inner: Mutex::new(Retained::default()),
        }
    }

    pub fn record(&self, event: TaskEvent) {
        if self.max_rounds == 0 {
            return;
        }
        let window = self.max_rounds as u64;
        let mut guard = self.inner.lock().expect("event log mutex poisoned");
        while let Some(oldest) = guard.events.front().map(|front| front.round) {
            if oldest.saturating_add(window) > event.round {
                break;
            }
            guard.events.pop_front();
            guard.evicted_through = Some(oldest);
        }
        guard.events.push_back(event);
    }

    /// Snapshot of the retained events in recording order.
    pub fn snapshot(&self) -> Vec<TaskEvent> {
        let guard = self.inner.lock().expect("event log mutex poisoned");
        guard.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("event log mutex poisoned");
        guard.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, phase: Phase) -> usize {
        let guard = self.inner.lock().expect("event log mutex poisoned");
        guard.events.iter().filter(|event| event.phase == phase).count()
    }

    /// First round still held, or `None` when nothing was recorded.
    pub fn first_round(&self) -> Option<Round> {
        let guard = self.inner.lock().expect("event log mutex poisoned");
        guard.events.front().map(|event| event.round)
    }

    /// Group index executed in each retained round, in round order.
    pub fn group_sequence(&self) -> Vec<GroupIndex> {
        let (_, tallies) = self.tally();
        tallies
            .values()
            .filter_map(|tally| tally.groups.iter().next().copied())
            .collect()
    }

    fn tally(&self) -> (Round, BTreeMap<Round, RoundTally>) {
        let guard = self.inner.lock().expect("event log mutex poisoned");
        let first = guard.evicted_through.map_or(0, |round| round + 1);
        let mut rounds: BTreeMap<Round, RoundTally> = BTreeMap::new();
        for event in guard.events.iter() {
            let tally = rounds.entry(event.round).or_default();
            tally.groups.insert(event.group);
            match event.phase {
                Phase::Start => {
                    tally.started.insert(event.slot);
                }
                Phase::End => {
                    tally.ended.insert(event.slot);
                }
            }
        }
        (first, rounds)
    }

    /// Check group atomicity, rotation order and per-round group agreement over
    /// the retained rounds.
    pub fn audit(&self, slots: usize, groups: usize) -> AuditReport {
        let (first, rounds) = self.tally();
        let mut report = AuditReport {
            rounds: rounds.len() as u64,
            ..AuditReport::default()
        };
        for (expected_round, (round, tally)) in rounds.iter().enumerate() {
            if tally.started.len() != slots || tally.ended.len() != slots {
                report.partial_rounds += 1;
            }
            if tally.started != tally.ended {
                report.unmatched_rounds += 1;
            }
            if tally.groups.len() > 1 {
                report.mixed_group_rounds += 1;
            }
            // Retained rounds follow the last evicted one (or zero) without gaps.
            let expected_group = (*round % groups as u64) as GroupIndex;
            if *round != first + expected_round as u64
                || tally.groups.iter().any(|group| *group != expected_group)
            {
                report.rotation_violations += 1;
            }
        }
        report
    }
}

#[derive(Default)]
struct RoundTally {
    groups: BTreeSet<GroupIndex>,
    started: BTreeSet<SlotIndex>,
    ended: BTreeSet<SlotIndex>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub rounds: u64,
    /// Rounds where not every slot started and ended a task.
    pub partial_rounds: usize,
    pub unmatched_rounds: usize,
    /// Rounds whose tasks came from more than one group.
    pub mixed_group_rounds: usize,
    /// Rounds whose group is not `round % G`.
    pub rotation_violations: usize,
}

impl AuditReport {
    pub fn atomicity_violation(&self) -> bool {
        self.partial_rounds > 0 || self.unmatched_rounds > 0
    }

    pub fn rotation_violation(&self) -> bool {
        self.rotation_violations > 0 || self.mixed_group_rounds > 0
    }

    pub fn is_clean(&self) -> bool {
        !self.atomicity_violation() && !self.rotation_violation()
    }
}
