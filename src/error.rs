//! Error types for nova-galaxy.

use std::time::Duration;

use crate::state::WorkState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{target} execution failed: {message}")]
    Execution { target: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Invalid call sequences. Always reported to the caller immediately.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("{target} (run: {run_id}) is already in state {state}, cannot start a new run")]
    AlreadyRunning {
        target: String,
        run_id: String,
        state: WorkState,
    },

    #[error("Parameter {name} not found")]
    UnknownParameter { name: String },

    #[error("{target} has no remote run id yet")]
    NotSubmitted { target: String },

    #[error("{name} has no local path to upload")]
    NothingToUpload { name: String },

    #[error("{kind} {name} is not bound to a data store")]
    Unbound { kind: &'static str, name: String },
}

/// Parameter-to-remote binding failures. Always fatal at submit time.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Label '{label}' not found in {target}. Available labels: {available:?}")]
    UnknownLabel {
        label: String,
        target: String,
        available: Vec<String>,
    },

    #[error("{kind} parameter '{label}' for {target} has no remote id and nothing to upload")]
    MissingId {
        kind: &'static str,
        label: String,
        target: String,
    },

    #[error("No uploaded id recorded for parameter '{label}'")]
    UploadMissing { label: String },
}

/// Failures reported by, or while talking to, the remote execution service.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{operation} request failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("Waiting for {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("Upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
