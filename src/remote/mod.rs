//! Remote execution service boundary.
//!
//! The core never performs network I/O itself; everything goes through
//! [`RemoteService`]. [`GalaxyClient`] is the HTTP implementation.

mod galaxy;
#[cfg(test)]
pub(crate) mod mock;

pub use galaxy::GalaxyClient;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::binder::Bindings;
use crate::error::RemoteError;

/// Kind of remote definition being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Tool,
    Workflow,
}

/// A tool or workflow definition, identified by its remote id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl Target {
    pub fn tool(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Tool,
            id: id.into(),
        }
    }

    pub fn workflow(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Workflow,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TargetKind::Tool => write!(f, "tool {}", self.id),
            TargetKind::Workflow => write!(f, "workflow {}", self.id),
        }
    }
}

/// Kind of a remote data reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    #[serde(rename = "hda")]
    Dataset,
    #[serde(rename = "hdca")]
    Collection,
}

impl DataKind {
    /// Source tag used by the remote API.
    pub fn src(&self) -> &'static str {
        match self {
            Self::Dataset => "hda",
            Self::Collection => "hdca",
        }
    }
}

/// Declared labels of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetMetadata {
    /// Labels accepting datasets, collections or scalar values.
    pub inputs: Vec<String>,
    /// Labels of steps accepting raw parameter values.
    pub steps: Vec<String>,
}

/// Result of a successful invoke call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRun {
    pub run_id: String,
    pub status: String,
}

/// One produced output as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub name: String,
    pub id: String,
}

/// Remote status payload for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub state: String,
    pub outputs: Vec<OutputEntry>,
    pub output_collections: Vec<OutputEntry>,
}

impl RemoteStatus {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            ..Default::default()
        }
    }
}

/// Console streams of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Capability to drive a remote execution service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Resolve a results-container by name, creating it if absent. Returns its id.
    async fn get_or_create_store(&self, name: &str) -> Result<String, RemoteError>;

    /// Declared input and step labels of a target.
    async fn target_metadata(&self, target: &Target) -> Result<TargetMetadata, RemoteError>;

    /// Upload a local file into a store. Returns the new dataset id.
    async fn upload_dataset(&self, store_id: &str, path: &Path) -> Result<String, RemoteError>;

    /// Upload local files and group them as a list collection. Returns the collection id.
    async fn upload_collection(
        &self,
        store_id: &str,
        name: &str,
        paths: &[PathBuf],
    ) -> Result<String, RemoteError>;

    /// Start a run of `target` in the given store.
    async fn invoke(
        &self,
        target: &Target,
        store_id: &str,
        bindings: &Bindings,
    ) -> Result<RemoteRun, RemoteError>;

    /// Fetch the current status of a run.
    async fn status(&self, target: &Target, run_id: &str) -> Result<RemoteStatus, RemoteError>;

    /// Block until the run reaches a terminal status.
    async fn wait_for_terminal(&self, target: &Target, run_id: &str) -> Result<(), RemoteError>;

    /// Request cancellation of a run.
    async fn cancel(&self, target: &Target, run_id: &str) -> Result<bool, RemoteError>;

    /// Fetch stdout and stderr of a run.
    async fn console_output(
        &self,
        target: &Target,
        run_id: &str,
    ) -> Result<ConsoleOutput, RemoteError>;

    /// Download the content of a dataset or collection.
    async fn download(&self, kind: DataKind, id: &str) -> Result<Vec<u8>, RemoteError>;
}
