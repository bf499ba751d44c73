//! Error taxonomy for rotation runs.

use crate::types::{GroupIndex, Round, SlotIndex};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RotationError>;

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// Slot count, group count or another construction parameter is unusable.
    #[error("invalid config: {parameter} - {message}")]
    InvalidConfig {
        parameter: &'static str,
        message: String,
    },

    /// A group does not hold exactly one task per slot.
    #[error("malformed group {group}: expected {expected} tasks, got {actual}")]
    MalformedGroup {
        group: GroupIndex,
        expected: usize,
        actual: usize,
    },

    /// A peer left a barrier while others were waiting on it.
    #[error("{barrier} barrier broken during round {round}")]
    BarrierBroken { barrier: &'static str, round: Round },

    /// A worker was cancelled outside the normal stop path.
    #[error("slot {slot} interrupted during round {round}")]
    InterruptedWhileRunning { slot: SlotIndex, round: Round },

    #[error("coordinator already started")]
    AlreadyStarted,

    #[error("unknown slot {slot} (slots={slots})")]
    UnknownSlot { slot: SlotIndex, slots: usize },

    #[error("failed to spawn slot worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// Run-level failure reported once every worker has been joined.
    #[error("run aborted after {rounds_completed} rounds: {reason}")]
    RunAborted {
        reason: String,
        rounds_completed: u64,
    },
}

impl RotationError {
    pub(crate) fn invalid(parameter: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            parameter,
            message: message.into(),
        }
    }

    /// True for failures raised while workers were running.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::BarrierBroken { .. } | Self::InterruptedWhileRunning { .. } | Self::RunAborted { .. }
        )
    }
}
