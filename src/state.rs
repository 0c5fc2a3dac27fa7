//! Work state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Nothing has been submitted yet.
    NotStarted,
    /// Resolving target metadata and binding parameters.
    PreparingInputs,
    /// Uploading local datasets into the data store.
    Uploading,
    /// Accepted by the remote service, waiting to run.
    Queued,
    /// Executing remotely.
    Running,
    /// Paused by the remote service.
    Paused,
    /// Completed successfully.
    Finished,
    /// Failed, either locally or remotely.
    Error,
    /// Cancelled on request.
    Cancelled,
}

impl WorkState {
    /// Map a status string reported by the remote service.
    ///
    /// Unrecognized strings map to `Error` so an unknown status is never
    /// mistaken for success.
    pub fn from_remote(status: &str) -> Self {
        match status {
            "new" | "queued" | "waiting" | "ready" | "scheduled" => Self::Queued,
            "upload" => Self::Uploading,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "ok" | "completed" => Self::Finished,
            "failed" | "error" => Self::Error,
            "cancelled" | "deleted" => Self::Cancelled,
            _ => Self::Error,
        }
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkState) -> bool {
        use WorkState::*;

        // Any non-terminal state may fail.
        if target == Error && !self.is_terminal() {
            return true;
        }

        matches!(
            (self, target),
            // Starting a run (fresh or after a previous terminal state)
            (NotStarted, PreparingInputs) |
            (Finished, PreparingInputs) | (Error, PreparingInputs) | (Cancelled, PreparingInputs) |
            // Preparation
            (PreparingInputs, Uploading) | (PreparingInputs, Queued) |
            (Uploading, Queued) |
            // Remote-driven progress; coarse polling may skip intermediate states.
            // Jobs with failed inputs are paused before they ever run.
            (Queued, Running) | (Queued, Paused) | (Queued, Finished) | (Queued, Cancelled) |
            (Running, Paused) | (Running, Finished) | (Running, Cancelled) |
            (Paused, Running) | (Paused, Finished) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Check if a new run may be started from this state.
    pub fn can_start(&self) -> bool {
        *self == Self::NotStarted || self.is_terminal()
    }

    /// Check if a cancel request makes sense from this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::PreparingInputs => "preparing_inputs",
            Self::Uploading => "uploading",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: WorkState,
    /// New state.
    pub to: WorkState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}
