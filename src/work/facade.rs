//! Public entry points for running tools and workflows.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use crate::data::{Datastore, Outputs};
use crate::error::{Error, UsageError};
use crate::params::Parameters;
use crate::remote::Target;
use crate::state::{StateTransition, WorkState};
use crate::work::invocation::{Invocation, InvocationStatus};

/// A runnable remote definition holding its most recent invocation.
///
/// Each call to [`run`](Work::run) creates a fresh [`Invocation`]; the
/// query methods all speak about that latest one.
pub struct Work {
    target: Target,
    current: RwLock<Option<Arc<Invocation>>>,
}

impl Work {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            current: RwLock::new(None),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Start a new run in `store`.
    ///
    /// Refused while the previous run is still active. See
    /// [`Invocation::run`] for the meaning of `wait`.
    pub async fn run(
        &self,
        store: &Datastore,
        params: Parameters,
        wait: bool,
    ) -> Result<Option<Outputs>, Error> {
        // The lock is held until the new run has left `NotStarted`, so a
        // concurrent caller always sees it as active.
        let (invocation, handle) = {
            let mut current = self.current.write().await;
            if let Some(previous) = current.as_ref() {
                let status = previous.current().await;
                if !status.state.can_start() {
                    return Err(UsageError::AlreadyRunning {
                        target: self.target.to_string(),
                        run_id: status.run_id.unwrap_or_else(|| "none".into()),
                        state: status.state,
                    }
                    .into());
                }
            }
            let invocation = Arc::new(Invocation::new(self.target.clone(), store.clone()));
            let handle = invocation.launch(params, wait).await?;
            *current = Some(Arc::clone(&invocation));
            (invocation, handle)
        };

        match handle {
            Some(handle) => invocation.finish(handle).await,
            None => Ok(None),
        }
    }

    /// The latest invocation, if any.
    pub async fn invocation(&self) -> Option<Arc<Invocation>> {
        self.current.read().await.clone()
    }

    /// State of the latest run; `NotStarted` before the first one.
    pub async fn status(&self) -> WorkState {
        match self.invocation().await {
            Some(invocation) => invocation.state().await,
            None => WorkState::NotStarted,
        }
    }

    /// Full status of the latest run.
    pub async fn details(&self) -> Option<InvocationStatus> {
        match self.invocation().await {
            Some(invocation) => Some(invocation.status().await),
            None => None,
        }
    }

    pub async fn results(&self) -> Result<Option<Outputs>, Error> {
        match self.invocation().await {
            Some(invocation) => invocation.results().await,
            None => Ok(None),
        }
    }

    /// Cancel the latest run. `false` if there is nothing to cancel.
    pub async fn cancel(&self) -> Result<bool, Error> {
        match self.invocation().await {
            Some(invocation) => invocation.cancel().await,
            None => Ok(false),
        }
    }

    /// Alias for [`cancel`](Self::cancel).
    pub async fn stop(&self) -> Result<bool, Error> {
        self.cancel().await
    }

    /// Remote run id of the latest run.
    pub async fn run_id(&self) -> Option<String> {
        match self.invocation().await {
            Some(invocation) => invocation.run_id().await,
            None => None,
        }
    }

    pub async fn stdout(&self) -> Result<Option<String>, Error> {
        Ok(self.console().await?.map(|c| c.0))
    }

    pub async fn stderr(&self) -> Result<Option<String>, Error> {
        Ok(self.console().await?.map(|c| c.1))
    }

    /// State changes of the latest run.
    pub async fn subscribe(&self) -> Option<broadcast::Receiver<StateTransition>> {
        match self.invocation().await {
            Some(invocation) => Some(invocation.subscribe().await),
            None => None,
        }
    }

    async fn console(&self) -> Result<Option<(String, String)>, Error> {
        let Some(invocation) = self.invocation().await else {
            return Ok(None);
        };
        Ok(invocation
            .console_output()
            .await?
            .map(|out| (out.stdout, out.stderr)))
    }
}

/// A remote tool.
pub struct Tool(Work);

impl Tool {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Work::new(Target::tool(id)))
    }

    pub fn id(&self) -> &str {
        &self.0.target().id
    }
}

impl Deref for Tool {
    type Target = Work;

    fn deref(&self) -> &Work {
        &self.0
    }
}

/// A remote workflow.
pub struct Workflow(Work);

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Work::new(Target::workflow(id)))
    }

    pub fn id(&self) -> &str {
        &self.0.target().id
    }
}

impl Deref for Workflow {
    type Target = Work;

    fn deref(&self) -> &Work {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockService;
    use crate::remote::{OutputEntry, RemoteStatus, TargetKind};

    fn store(mock: Arc<MockService>) -> Datastore {
        Datastore::new("nova_galaxy_testing", "h1", mock)
    }

    #[tokio::test]
    async fn idle_facade() {
        let wf = Workflow::new("wf1");
        assert_eq!(wf.target().kind, TargetKind::Workflow);
        assert_eq!(wf.status().await, WorkState::NotStarted);
        assert!(wf.details().await.is_none());
        assert!(wf.results().await.unwrap().is_none());
        assert!(!wf.cancel().await.unwrap());
        assert!(!wf.stop().await.unwrap());
        assert!(wf.run_id().await.is_none());
        assert!(wf.stdout().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_refused_while_active() {
        let mock = Arc::new(MockService::new().with_statuses(vec![RemoteStatus::new("ok")]));
        let gate = mock.gate_wait();
        let tool = Tool::new("neutrons_remote_command");
        let store = store(mock.clone());

        tool.run(&store, Parameters::new(), false).await.unwrap();
        let err = tool.run(&store, Parameters::new(), false).await.unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::AlreadyRunning { .. })));

        gate.notify_one();
        tool.invocation().await.unwrap().join().await;
        assert_eq!(tool.status().await, WorkState::Finished);
        assert_eq!(tool.run_id().await.as_deref(), Some("run-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_start_only_one() {
        let mock = Arc::new(
            MockService::new()
                .with_invoke_status("running")
                .with_statuses(vec![RemoteStatus::new("running")]),
        );
        let _gate = mock.gate_wait();
        let tool = Arc::new(Tool::new("neutrons_remote_command"));
        let store = store(mock.clone());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let tool = Arc::clone(&tool);
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    tool.run(&store, Parameters::new(), false).await
                })
            })
            .collect();

        let mut started = 0;
        let mut refused = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(None) => started += 1,
                Err(Error::Usage(UsageError::AlreadyRunning { .. })) => refused += 1,
                other => panic!("unexpected run result: {other:?}"),
            }
        }
        assert_eq!((started, refused), (1, 1));

        let invocation = tool.invocation().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while invocation.run_id().await.is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run submitted");
        assert_eq!(mock.calls_named("invoke"), 1);
    }

    #[tokio::test]
    async fn each_run_gets_a_fresh_invocation() {
        let mock = Arc::new(MockService::new().with_statuses(vec![RemoteStatus {
            state: "ok".into(),
            outputs: vec![OutputEntry {
                name: "output".into(),
                id: "d1".into(),
            }],
            output_collections: vec![],
        }]));
        let wf = Workflow::new("wf1");
        let store = store(mock.clone());

        let outputs = wf.run(&store, Parameters::new(), true).await.unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        let first = wf.invocation().await.unwrap();

        wf.run(&store, Parameters::new(), true).await.unwrap();
        let second = wf.invocation().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.transitions().await.len(), second.transitions().await.len());
        assert!(wf.results().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn console_streams_of_latest_run() {
        let mock = Arc::new(
            MockService::new()
                .with_statuses(vec![RemoteStatus::new("ok")])
                .with_console("out", "err"),
        );
        let tool = Tool::new("t");
        tool.run(&store(mock), Parameters::new(), true).await.unwrap();
        assert_eq!(tool.stdout().await.unwrap().as_deref(), Some("out"));
        assert_eq!(tool.stderr().await.unwrap().as_deref(), Some("err"));
    }
}
