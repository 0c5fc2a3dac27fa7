//! One remote execution attempt.
//!
//! An [`Invocation`] owns the lifecycle of a single run: submission,
//! polling, waiting, cancellation and output collection. All state lives in
//! a [`RunRecord`] behind one lock and changes only through
//! [`RunRecord::transition_to`], which checks the edge against
//! [`WorkState::can_transition_to`].
//!
//! Every run started on an invocation gets a new generation number. The
//! background task of a run only writes while its generation is current,
//! so a stale task can never touch the record of a newer run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::binder::{ParameterBinder, PendingUpload, UploadSource};
use crate::data::{Datastore, Outputs};
use crate::error::{Error, RemoteError, UsageError};
use crate::params::Parameters;
use crate::remote::{ConsoleOutput, RemoteRun, RemoteStatus, Target};
use crate::state::{StateTransition, WorkState};

/// Message recorded when a cancel request is confirmed.
pub const CANCELLED_BY_USER: &str = "Invocation cancelled by user.";

const MAX_TRANSITIONS: usize = 200;
const EVENT_CAPACITY: usize = 64;

/// Point-in-time view of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationStatus {
    pub state: WorkState,
    pub error_msg: Option<String>,
    pub run_id: Option<String>,
}

/// Mutable state of an invocation.
struct RunRecord {
    generation: u64,
    state: WorkState,
    error_msg: Option<String>,
    run_id: Option<String>,
    snapshot: Option<RemoteStatus>,
    transitions: Vec<StateTransition>,
    events: broadcast::Sender<StateTransition>,
}

impl RunRecord {
    fn new(events: broadcast::Sender<StateTransition>) -> Self {
        Self {
            generation: 0,
            state: WorkState::NotStarted,
            error_msg: None,
            run_id: None,
            snapshot: None,
            transitions: Vec::new(),
            events,
        }
    }

    fn status(&self) -> InvocationStatus {
        InvocationStatus {
            state: self.state,
            error_msg: self.error_msg.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Transition to a new state. Moving to the current state is a no-op.
    fn transition_to(
        &mut self,
        new_state: WorkState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if self.state == new_state {
            return Ok(());
        }
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        let transition = StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        };

        self.transitions.push(transition.clone());
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;

        // Ok if nobody is listening
        let _ = self.events.send(transition);
        Ok(())
    }

    /// Record a failure. Ignored once terminal.
    fn fail(&mut self, message: String) {
        if self.transition_to(WorkState::Error, Some(message.clone())).is_ok() {
            self.error_msg = Some(message);
        }
    }
}

struct Shared {
    local_id: Uuid,
    target: Target,
    store: Datastore,
    record: RwLock<RunRecord>,
}

impl Shared {
    async fn status(&self) -> InvocationStatus {
        self.record.read().await.status()
    }

    /// Apply `f` to the record if `generation` is still the current run.
    async fn update<F, R>(&self, generation: u64, f: F) -> Option<R>
    where
        F: FnOnce(&mut RunRecord) -> R,
    {
        let mut record = self.record.write().await;
        if record.generation != generation {
            tracing::debug!(
                invocation = %self.local_id,
                stale = generation,
                current = record.generation,
                "Dropping update from a superseded run"
            );
            return None;
        }
        Some(f(&mut *record))
    }

    /// Reset the record for a new run and move to `PreparingInputs`.
    async fn begin_run(&self) -> Result<u64, UsageError> {
        let mut record = self.record.write().await;
        if !record.state.can_start() {
            return Err(UsageError::AlreadyRunning {
                target: self.target.to_string(),
                run_id: record.run_id.clone().unwrap_or_else(|| "none".into()),
                state: record.state,
            });
        }

        record.generation += 1;
        record.error_msg = None;
        record.run_id = None;
        record.snapshot = None;
        record
            .transition_to(WorkState::PreparingInputs, Some("New run".into()))
            .map_err(|_| UsageError::AlreadyRunning {
                target: self.target.to_string(),
                run_id: "none".into(),
                state: record.state,
            })?;

        tracing::info!(
            invocation = %self.local_id,
            target = %self.target,
            store = %self.store.name(),
            "Preparing run"
        );
        Ok(record.generation)
    }

    /// Resolve, bind, upload and invoke. Failures end in `Error`, never propagate.
    async fn submit(&self, generation: u64, params: &Parameters) {
        match self.prepare_and_invoke(generation, params).await {
            Ok(run) => {
                let state = WorkState::from_remote(&run.status);
                self.update(generation, |record| {
                    record.run_id = Some(run.run_id.clone());
                    let reason = Some(format!("Remote status {}", run.status));
                    if state == WorkState::Error {
                        record.fail(format!(
                            "{} rejected on submission. Remote state: {}",
                            self.target, run.status
                        ));
                    } else if let Err(e) = record.transition_to(state, reason) {
                        tracing::warn!(run_id = %run.run_id, "Ignoring initial remote status: {e}");
                    }
                })
                .await;
                tracing::info!(
                    invocation = %self.local_id,
                    target = %self.target,
                    run_id = %run.run_id,
                    status = %run.status,
                    "Submitted"
                );
            }
            Err(e) => {
                tracing::warn!(
                    invocation = %self.local_id,
                    target = %self.target,
                    "Submission failed: {e}"
                );
                self.update(generation, |record| {
                    record.run_id = None;
                    record.fail(format!("Failed to prepare or submit {}: {e}", self.target));
                })
                .await;
            }
        }
    }

    async fn prepare_and_invoke(
        &self,
        generation: u64,
        params: &Parameters,
    ) -> Result<RemoteRun, Error> {
        let service = self.store.service();
        let metadata = service.target_metadata(&self.target).await?;
        let plan = ParameterBinder::new(&self.target, &metadata).plan(params)?;

        let uploaded = if plan.pending().is_empty() {
            HashMap::new()
        } else {
            self.advance(generation, WorkState::Uploading).await;
            self.upload_all(plan.pending()).await?
        };
        let bindings = plan.complete(&uploaded)?;

        self.advance(generation, WorkState::Queued).await;
        Ok(service.invoke(&self.target, self.store.id(), &bindings).await?)
    }

    /// Issue every upload at once and wait for all of them.
    async fn upload_all(
        &self,
        pending: &[PendingUpload],
    ) -> Result<HashMap<String, String>, RemoteError> {
        let service = self.store.service();
        let store_id = self.store.id();
        tracing::debug!(count = pending.len(), store = %self.store.name(), "Uploading inputs");

        let uploads = pending.iter().map(|p| async move {
            let id = match &p.source {
                UploadSource::Dataset { path } => service.upload_dataset(store_id, path).await?,
                UploadSource::Collection { name, paths } => {
                    service.upload_collection(store_id, name, paths).await?
                }
            };
            Ok::<_, RemoteError>((p.label.clone(), id))
        });

        let ids = futures::future::try_join_all(uploads).await?;
        Ok(ids.into_iter().collect())
    }

    async fn advance(&self, generation: u64, state: WorkState) {
        self.update(generation, |record| {
            if let Err(e) = record.transition_to(state, None) {
                tracing::warn!(invocation = %self.local_id, "{e}");
            }
        })
        .await;
    }

    /// Fetch the remote status once and fold it into the record.
    async fn refresh(&self, generation: u64, run_id: &str) -> Result<(), RemoteError> {
        let status = self.store.service().status(&self.target, run_id).await?;
        tracing::debug!(run_id = %run_id, remote = %status.state, "Polled status");
        self.apply_status(generation, status).await;
        Ok(())
    }

    async fn apply_status(&self, generation: u64, status: RemoteStatus) {
        let state = WorkState::from_remote(&status.state);
        self.update(generation, |record| {
            if state == WorkState::Error {
                record.fail(format!(
                    "{} failed. Remote state: {}",
                    self.target, status.state
                ));
                return;
            }
            match record.transition_to(state, Some(format!("Remote status {}", status.state))) {
                Ok(()) if state.is_terminal() => record.snapshot = Some(status),
                Ok(()) => {}
                Err(e) => tracing::warn!(
                    invocation = %self.local_id,
                    remote = %status.state,
                    "Ignoring remote status: {e}"
                ),
            }
        })
        .await;
    }

    /// Background body of a run: submit, wait for the remote, observe the outcome.
    async fn run_to_completion(self: Arc<Self>, generation: u64, params: Parameters) {
        self.submit(generation, &params).await;

        let Some(run_id) = self
            .update(generation, |record| record.run_id.clone())
            .await
            .flatten()
        else {
            return;
        };

        let waited = self
            .store
            .service()
            .wait_for_terminal(&self.target, &run_id)
            .await;

        let outcome = match waited {
            Ok(()) => self.refresh(generation, &run_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::warn!(run_id = %run_id, "Run failed while waiting: {e}");
            self.update(generation, |record| {
                record.fail(format!("Error while waiting for {}: {e}", self.target));
            })
            .await;
        }

        let status = self.status().await;
        tracing::info!(
            invocation = %self.local_id,
            run_id = %run_id,
            state = %status.state,
            "Run ended"
        );
    }
}

/// Background task of a non-blocking run.
struct RunTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RunTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One remote execution attempt of a tool or workflow.
pub struct Invocation {
    shared: Arc<Shared>,
    task: Mutex<Option<RunTask>>,
}

impl Invocation {
    pub fn new(target: Target, store: Datastore) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                local_id: Uuid::new_v4(),
                target,
                store,
                record: RwLock::new(RunRecord::new(events)),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    pub fn store(&self) -> &Datastore {
        &self.shared.store
    }

    /// Subscribe to accepted state transitions.
    pub async fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.record.read().await.events.subscribe()
    }

    /// Transition history of this invocation, oldest first.
    pub async fn transitions(&self) -> Vec<StateTransition> {
        self.shared.record.read().await.transitions.clone()
    }

    /// Remote run id, once submission succeeded.
    pub async fn run_id(&self) -> Option<String> {
        self.shared.record.read().await.run_id.clone()
    }

    /// Cached status, without contacting the remote service.
    pub async fn current(&self) -> InvocationStatus {
        self.shared.status().await
    }

    /// Submit in the calling task.
    ///
    /// Only usage errors are returned; every other failure is recorded as
    /// `Error` with a message.
    pub async fn submit(&self, params: &Parameters) -> Result<(), UsageError> {
        let mut task = self.task.lock().await;
        let generation = self.shared.begin_run().await?;
        task.take();
        drop(task);
        self.shared.submit(generation, params).await;
        Ok(())
    }

    /// Submit and follow the run on a background task.
    ///
    /// With `wait`, suspends until the run is terminal and returns its
    /// outputs, failing if it ended in `Error`. Without, returns `None`
    /// immediately.
    pub async fn run(&self, params: Parameters, wait: bool) -> Result<Option<Outputs>, Error> {
        match self.launch(params, wait).await? {
            Some(handle) => self.finish(handle).await,
            None => Ok(None),
        }
    }

    /// Begin a run and spawn its background task.
    ///
    /// The state has left `NotStarted` when this returns. With `wait` the
    /// task handle is handed back to the caller instead of being kept.
    pub(crate) async fn launch(
        &self,
        params: Parameters,
        wait: bool,
    ) -> Result<Option<JoinHandle<()>>, UsageError> {
        let mut task = self.task.lock().await;
        let generation = self.shared.begin_run().await?;

        let token = CancellationToken::new();
        let child = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {
                    tracing::debug!(generation, "Background run cancelled");
                }
                _ = shared.run_to_completion(generation, params) => {}
            }
        });

        if !wait {
            *task = Some(RunTask {
                cancel: token,
                handle: Some(handle),
            });
            return Ok(None);
        }

        *task = Some(RunTask {
            cancel: token,
            handle: None,
        });
        Ok(Some(handle))
    }

    /// Await a launched run and turn its end state into outputs.
    pub(crate) async fn finish(&self, handle: JoinHandle<()>) -> Result<Option<Outputs>, Error> {
        if let Err(e) = handle.await {
            return Err(Error::Execution {
                target: self.shared.target.to_string(),
                message: format!("background run aborted: {e}"),
            });
        }

        let status = self.shared.status().await;
        if status.state == WorkState::Error {
            return Err(Error::Execution {
                target: self.shared.target.to_string(),
                message: status.error_msg.unwrap_or_default(),
            });
        }
        self.results().await
    }

    /// Wait for the background task of a non-blocking run to finish.
    pub async fn join(&self) {
        let handle = self.task.lock().await.as_mut().and_then(|t| t.handle.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Current state, polling the remote service if the run is still active.
    pub async fn state(&self) -> WorkState {
        self.status().await.state
    }

    /// Current status, polling the remote service if the run is still active.
    ///
    /// Terminal states are served from cache. A failed poll is logged and
    /// the cached status is returned.
    pub async fn status(&self) -> InvocationStatus {
        let (generation, state, run_id) = {
            let record = self.shared.record.read().await;
            (record.generation, record.state, record.run_id.clone())
        };

        if state.is_terminal() {
            return self.shared.status().await;
        }
        if let Some(run_id) = run_id {
            if let Err(e) = self.shared.refresh(generation, &run_id).await {
                tracing::warn!(run_id = %run_id, "Could not fetch state: {e}");
            }
        }
        self.shared.status().await
    }

    /// Block until the remote service reports the run terminal.
    pub async fn wait_for_results(&self) -> Result<(), Error> {
        let run_id = self.require_run_id().await?;
        self.shared
            .store
            .service()
            .wait_for_terminal(&self.shared.target, &run_id)
            .await?;
        Ok(())
    }

    /// Outputs of a finished run; `None` while not finished.
    pub async fn results(&self) -> Result<Option<Outputs>, Error> {
        let status = self.status().await;
        if status.state != WorkState::Finished {
            tracing::debug!(
                target = %self.shared.target,
                state = %status.state,
                "No results yet"
            );
            return Ok(None);
        }

        let cached = self.shared.record.read().await.snapshot.clone();
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                let run_id = self.require_run_id().await?;
                let fetched = self
                    .shared
                    .store
                    .service()
                    .status(&self.shared.target, &run_id)
                    .await?;
                self.shared.record.write().await.snapshot = Some(fetched.clone());
                fetched
            }
        };

        Ok(Some(Outputs::from_status(&snapshot, &self.shared.store)))
    }

    /// Ask the remote service to cancel the run.
    ///
    /// Returns `false` when there is nothing to cancel or the remote side
    /// declined. The state only changes once the remote confirms.
    pub async fn cancel(&self) -> Result<bool, Error> {
        let (generation, run_id) = {
            let record = self.shared.record.read().await;
            match &record.run_id {
                Some(run_id) if record.state.is_cancellable() => {
                    (record.generation, run_id.clone())
                }
                _ => return Ok(false),
            }
        };

        let accepted = self
            .shared
            .store
            .service()
            .cancel(&self.shared.target, &run_id)
            .await?;
        if !accepted {
            tracing::info!(run_id = %run_id, "Remote declined cancellation");
            return Ok(false);
        }

        let cancelled = self
            .shared
            .update(generation, |record| {
                match record.transition_to(WorkState::Cancelled, Some("Cancel requested".into())) {
                    Ok(()) => {
                        record.error_msg = Some(CANCELLED_BY_USER.to_string());
                        true
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, "Cancel confirmed too late: {e}");
                        false
                    }
                }
            })
            .await
            .unwrap_or(false);

        if cancelled {
            tracing::info!(run_id = %run_id, target = %self.shared.target, "Cancelled");
        }
        Ok(cancelled)
    }

    /// Console streams of the run; `None` before submission.
    pub async fn console_output(&self) -> Result<Option<ConsoleOutput>, Error> {
        let Some(run_id) = self.run_id().await else {
            return Ok(None);
        };
        let output = self
            .shared
            .store
            .service()
            .console_output(&self.shared.target, &run_id)
            .await?;
        Ok(Some(output))
    }

    async fn require_run_id(&self) -> Result<String, UsageError> {
        self.run_id().await.ok_or_else(|| UsageError::NotSubmitted {
            target: self.shared.target.to_string(),
        })
    }
}
