//! Task state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a running slot.
    #[default]
    Queued,
    /// A driver is transferring bytes.
    Running,
    /// Stopped by the user; downloaded data is kept.
    Paused,
    /// Output written.
    Completed,
    /// Failed; may be retried when the error is retryable.
    Error,
    /// Stopped by the user; partial data deleted.
    Canceled,
}

impl TaskStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether no automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }

    /// Whether the task may still be canceled.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    /// Validate a state transition.
    ///
    /// `running -> queued` is the demotion used by clean shutdown and crash
    /// recovery; `paused -> queued` is re-admission on resume.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Running | Canceled)
                | (Running, Completed | Error | Paused | Canceled | Queued)
                | (Paused, Running | Queued | Canceled)
                | (Error, Queued)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: TaskStatus) -> Result<TaskStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self, target))
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of a running task, persisted for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    /// Bytes or segments are being fetched; safe to resume.
    #[default]
    Transfer,
    /// Segments are being concatenated into the output file.
    Finalizing,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Finalizing => "finalizing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(Self::Transfer),
            "finalizing" => Some(Self::Finalizing),
            _ => None,
        }
    }
}
