//! Hooks an application implements to have a tool driven by a runner.

use async_trait::async_trait;

use crate::data::Datastore;
use crate::params::Parameters;
use crate::work::Tool;

/// Application-side description of one tool run.
///
/// The runner calls `validate_for_run`, then `prepare_data` with the
/// resolved store, then `prepare_tool`, and starts the returned tool.
/// `get_results` is called on demand once the run has produced outputs.
#[async_trait]
pub trait BasicTool: Send + Sync {
    async fn validate_for_run(&self) -> anyhow::Result<()>;

    async fn prepare_data(&self, store: &Datastore) -> anyhow::Result<()>;

    async fn prepare_tool(&self) -> anyhow::Result<(Tool, Parameters)>;

    async fn get_results(&self, tool: &Tool) -> anyhow::Result<Vec<u8>>;
}
