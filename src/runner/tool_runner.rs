//! Command-driven tool execution.
//!
//! A [`ToolRunner`] listens on a [`SignalChannel`]. START prepares and
//! launches the tool in the background and follows it by polling, publishing
//! a progress event whenever the observed state changes. CANCEL asks the
//! remote service to stop the run. GET_RESULTS replies with the bytes the
//! [`BasicTool`] extracts from the finished run.
//!
//! Failures never escape the runner; they surface as `Error` progress events
//! or as an empty results reply.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::data::Datastore;
use crate::remote::RemoteService;
use crate::runner::basic_tool::BasicTool;
use crate::runner::signals::{CommandHandler, Progress, SignalChannel, ToolCommand};
use crate::state::WorkState;
use crate::work::{InvocationStatus, Tool};

/// Supplies the name of the store results go to, resolved at START.
pub type StoreNameFn = Box<dyn Fn() -> String + Send + Sync>;

struct RunnerInner {
    instance_id: String,
    basic_tool: Arc<dyn BasicTool>,
    store_name: StoreNameFn,
    service: Arc<dyn RemoteService>,
    progress: broadcast::Sender<Progress>,
    config: RunnerConfig,
    tool: RwLock<Option<Arc<Tool>>>,
}

/// Drives a [`BasicTool`] in response to commands on a [`SignalChannel`].
pub struct ToolRunner {
    inner: Arc<RunnerInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ToolRunner {
    /// Create a runner and register it on `channel`.
    pub async fn new(
        basic_tool: Arc<dyn BasicTool>,
        store_name: impl Fn() -> String + Send + Sync + 'static,
        service: Arc<dyn RemoteService>,
        channel: &SignalChannel,
        config: RunnerConfig,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            inner: Arc::new(RunnerInner {
                instance_id: channel.instance_id().to_string(),
                basic_tool,
                store_name: Box::new(store_name),
                service,
                progress: channel.publisher(),
                config,
                tool: RwLock::new(None),
            }),
            driver: Mutex::new(None),
        });
        channel.register(runner.clone()).await;
        runner
    }

    /// The tool of the latest START, once prepared.
    pub async fn tool(&self) -> Option<Arc<Tool>> {
        self.inner.tool.read().await.clone()
    }

    /// Wait until the background driver of the latest START has stopped.
    pub async fn join(&self) {
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn start(&self) {
        let mut driver = self.driver.lock().await;
        if driver.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(
                instance = %self.inner.instance_id,
                "START ignored, a run is already being followed"
            );
            return;
        }

        let inner = Arc::clone(&self.inner);
        // The driver may have given up polling while the remote run goes on.
        if let Some(tool) = self.tool().await {
            let state = tool.status().await;
            if !state.can_start() {
                warn!(
                    instance = %self.inner.instance_id,
                    %state,
                    "START while the previous run is active, following it again"
                );
                *driver = Some(tokio::spawn(async move { inner.follow(&tool).await }));
                return;
            }
        }
        *driver = Some(tokio::spawn(inner.drive()));
    }

    async fn cancel(&self) {
        let Some(tool) = self.tool().await else {
            debug!(instance = %self.inner.instance_id, "CANCEL before any run");
            return;
        };
        match tool.cancel().await {
            Ok(true) => info!(instance = %self.inner.instance_id, "Cancellation accepted"),
            Ok(false) => debug!(instance = %self.inner.instance_id, "Nothing to cancel"),
            Err(e) => warn!(instance = %self.inner.instance_id, "Cancellation failed: {e}"),
        }
    }

    async fn results(&self) -> Option<Vec<u8>> {
        let tool = self.tool().await?;
        match self.inner.basic_tool.get_results(&tool).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(instance = %self.inner.instance_id, "Could not get results: {e:#}");
                None
            }
        }
    }
}

#[async_trait]
impl CommandHandler for ToolRunner {
    async fn handle(&self, command: ToolCommand) -> Option<Progress> {
        match command {
            ToolCommand::Start => {
                self.start().await;
                None
            }
            ToolCommand::Cancel => {
                self.cancel().await;
                None
            }
            ToolCommand::GetResults => Some(Progress::Results {
                results: self.results().await,
            }),
        }
    }
}

impl RunnerInner {
    async fn drive(self: Arc<Self>) {
        let tool = match self.launch().await {
            Ok(tool) => tool,
            Err(e) => {
                warn!(instance = %self.instance_id, "Tool preparation failed: {e:#}");
                self.publish(WorkState::Error, format!("{e:#}"));
                return;
            }
        };
        self.follow(&tool).await;
    }

    async fn launch(&self) -> anyhow::Result<Arc<Tool>> {
        self.basic_tool.validate_for_run().await?;

        let store_name = (self.store_name)();
        let store = Datastore::open(Arc::clone(&self.service), &store_name).await?;
        self.basic_tool.prepare_data(&store).await?;

        let (tool, params) = self.basic_tool.prepare_tool().await?;
        let tool = Arc::new(tool);
        *self.tool.write().await = Some(Arc::clone(&tool));

        tool.run(&store, params, false).await?;
        info!(instance = %self.instance_id, tool = %tool.id(), store = %store_name, "Tool started");
        Ok(tool)
    }

    /// Poll until terminal, publishing each newly observed state once.
    async fn follow(&self, tool: &Tool) {
        let mut last: Option<WorkState> = None;

        for _ in 0..self.config.max_polls {
            if let Some(status) = tool.details().await {
                if last != Some(status.state) {
                    last = Some(status.state);
                    self.publish(status.state, describe(&status));
                }
                if status.state.is_terminal() {
                    return;
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            instance = %self.instance_id,
            polls = self.config.max_polls,
            "Stopped following before the run ended"
        );
    }

    fn publish(&self, state: WorkState, details: String) {
        debug!(instance = %self.instance_id, %state, "Publishing progress");
        // Ok if nobody is listening
        let _ = self.progress.send(Progress::State { state, details });
    }
}

fn describe(status: &InvocationStatus) -> String {
    match status.state {
        WorkState::Error | WorkState::Cancelled => status
            .error_msg
            .clone()
            .unwrap_or_else(|| status.state.to_string()),
        state => match &status.run_id {
            Some(run_id) => format!("{state} (run {run_id})"),
            None => state.to_string(),
        },
    }
}
