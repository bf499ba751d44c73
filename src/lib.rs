//! Slotted round-robin rendezvous: N slot workers serve G groups in lockstep rounds.
//!
//! Each round every slot worker resolves its task from the active group, meets its
//! peers at the entry barrier, uses the resource, and meets them again at the exit
//! barrier, whose last arriver rotates to the next group.

pub mod barrier;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod latch;
pub mod logging;
pub mod rotation;
pub mod types;
mod worker;

pub use coordinator::{Coordinator, CoordinatorConfig, RunReport, RunStatus};
pub use error::{Result, RotationError};
pub use events::{AuditReport, DEFAULT_EVENT_ROUNDS, EventLog, Phase, TaskEvent};
pub use types::{Group, GroupIndex, Round, SlotIndex, Task, TaskAction, TaskContext, TaskId, task_action};
pub use worker::WorkerExit;
