//! Shared identifiers and the slot/group/task model.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, RotationError};

/// Physical slot position in `[0, N)`.
pub type SlotIndex = usize;
/// Logical group position in `[0, G)`.
pub type GroupIndex = usize;
/// Display identity of a task: `group * N + slot`.
pub type TaskId = u64;
/// Zero-based round counter.
pub type Round = u64;

/// Resource-use work executed by one slot worker during one round.
pub type TaskAction = Arc<dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`TaskAction`].
pub fn task_action<F>(f: F) -> TaskAction
where
    F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-execution view handed to a task action.
pub struct TaskContext<'a> {
    pub task: TaskId,
    pub group: GroupIndex,
    pub slot: SlotIndex,
    pub round: Round,
    /// Per-slot scratch space, emptied before every task.
    pub scratch: &'a mut HashMap<String, String>,
    pub(crate) interrupted: &'a AtomicBool,
}

impl TaskContext<'_> {
    /// Whether the owning worker has been asked to cancel.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// One group member's unit of work, bound to a single slot.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub group: GroupIndex,
    pub slot: SlotIndex,
    action: TaskAction,
}

impl Task {
    /// Construct a task; the id is derived from the group and slot.
    pub fn new(group: GroupIndex, slot: SlotIndex, slots: usize, action: TaskAction) -> Self {
        Self {
            id: (group * slots + slot) as TaskId,
            group,
            slot,
            action,
        }
    }

    pub(crate) fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.id)
    }
}

/// A fixed bundle of exactly one task per slot.
#[derive(Clone, Debug)]
pub struct Group {
    index: GroupIndex,
    tasks: Vec<Task>,
}

impl Group {
    /// Build a group, checking it supplies exactly `slots` tasks in slot order.
    pub fn new(index: GroupIndex, slots: usize, tasks: Vec<Task>) -> Result<Self> {
        if tasks.len() != slots {
            return Err(RotationError::MalformedGroup {
                group: index,
                expected: slots,
                actual: tasks.len(),
            });
        }
        for (slot, task) in tasks.iter().enumerate() {
            if task.slot != slot || task.group != index {
                return Err(RotationError::invalid(
                    "tasks",
                    format!(
                        "group {index} holds {task} bound to group {} slot {} at position {slot}",
                        task.group, task.slot
                    ),
                ));
            }
            let expected_id = (index * slots + slot) as TaskId;
            if task.id != expected_id {
                return Err(RotationError::invalid(
                    "tasks",
                    format!("{task} at group {index} slot {slot} should be task-{expected_id}"),
                ));
            }
        }
        Ok(Self { index, tasks })
    }

    /// Build a group whose tasks all share one action.
    pub fn uniform(index: GroupIndex, slots: usize, action: TaskAction) -> Self {
        let tasks = (0..slots)
            .map(|slot| Task::new(index, slot, slots, Arc::clone(&action)))
            .collect();
        Self { index, tasks }
    }

    pub fn index(&self) -> GroupIndex {
        self.index
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task bound to `slot`; slots are validated at construction.
    pub fn task(&self, slot: SlotIndex) -> &Task {
        &self.tasks[slot]
    }
}
