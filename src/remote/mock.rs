//! Scripted in-memory remote service for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::binder::Bindings;
use crate::error::RemoteError;
use crate::remote::{
    ConsoleOutput, DataKind, RemoteRun, RemoteService, RemoteStatus, Target, TargetMetadata,
};

#[derive(Default)]
pub(crate) struct MockService {
    metadata: Mutex<TargetMetadata>,
    statuses: Mutex<VecDeque<RemoteStatus>>,
    invoke_status: Mutex<Option<String>>,
    invoke_fails: Mutex<bool>,
    failing_uploads: Mutex<HashSet<PathBuf>>,
    upload_delay: Mutex<Option<Duration>>,
    cancel_result: Mutex<Option<Result<bool, String>>>,
    console: Mutex<ConsoleOutput>,
    content: Mutex<HashMap<String, Vec<u8>>>,
    wait_gate: Mutex<Option<std::sync::Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
    last_bindings: Mutex<Option<Bindings>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(self, inputs: &[&str], steps: &[&str]) -> Self {
        *self.metadata.lock().unwrap() = TargetMetadata {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        };
        self
    }

    /// Status returned by the invoke call itself.
    pub fn with_invoke_status(self, status: &str) -> Self {
        *self.invoke_status.lock().unwrap() = Some(status.to_string());
        self
    }

    pub fn with_failing_invoke(self) -> Self {
        *self.invoke_fails.lock().unwrap() = true;
        self
    }

    /// Statuses returned by successive polls; the last one repeats.
    pub fn with_statuses(self, statuses: Vec<RemoteStatus>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_failing_upload(self, path: &str) -> Self {
        self.failing_uploads.lock().unwrap().insert(PathBuf::from(path));
        self
    }

    pub fn with_upload_delay(self, delay: Duration) -> Self {
        *self.upload_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn with_cancel_result(self, result: Result<bool, String>) -> Self {
        *self.cancel_result.lock().unwrap() = Some(result);
        self
    }

    pub fn with_console(self, stdout: &str, stderr: &str) -> Self {
        *self.console.lock().unwrap() = ConsoleOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        self
    }

    /// Make `wait_for_terminal` block until the returned gate is notified.
    pub fn gate_wait(&self) -> std::sync::Arc<Notify> {
        let gate = std::sync::Arc::new(Notify::new());
        *self.wait_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_content(&self, id: &str, bytes: &[u8]) {
        self.content
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    pub fn last_bindings(&self) -> Option<Bindings> {
        self.last_bindings.lock().unwrap().clone()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    fn next_status(&self) -> Option<RemoteStatus> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        }
    }
}

#[async_trait]
impl RemoteService for MockService {
    async fn get_or_create_store(&self, name: &str) -> Result<String, RemoteError> {
        self.record("get_or_create_store");
        Ok(format!("history-{name}"))
    }

    async fn target_metadata(&self, _target: &Target) -> Result<TargetMetadata, RemoteError> {
        self.record("target_metadata");
        Ok(self.metadata.lock().unwrap().clone())
    }

    async fn upload_dataset(&self, _store_id: &str, path: &Path) -> Result<String, RemoteError> {
        self.record("upload_dataset");
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_uploads.lock().unwrap().contains(path) {
            return Err(RemoteError::Upload {
                path: path.display().to_string(),
                reason: "disk quota exceeded".into(),
            });
        }
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("upload-{file}"))
    }

    async fn upload_collection(
        &self,
        _store_id: &str,
        name: &str,
        _paths: &[PathBuf],
    ) -> Result<String, RemoteError> {
        self.record("upload_collection");
        Ok(format!("collection-{name}"))
    }

    async fn invoke(
        &self,
        target: &Target,
        _store_id: &str,
        bindings: &Bindings,
    ) -> Result<RemoteRun, RemoteError> {
        self.record("invoke");
        *self.last_bindings.lock().unwrap() = Some(bindings.clone());
        if *self.invoke_fails.lock().unwrap() {
            return Err(RemoteError::Status {
                operation: format!("invoke {target}"),
                status: 400,
                body: "validation failed".into(),
            });
        }
        let status = self
            .invoke_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "new".to_string());
        Ok(RemoteRun {
            run_id: "run-1".into(),
            status,
        })
    }

    async fn status(&self, _target: &Target, run_id: &str) -> Result<RemoteStatus, RemoteError> {
        self.record("status");
        self.next_status().ok_or_else(|| RemoteError::NotFound {
            entity: "run".into(),
            id: run_id.to_string(),
        })
    }

    async fn wait_for_terminal(&self, _target: &Target, _run_id: &str) -> Result<(), RemoteError> {
        self.record("wait_for_terminal");
        let gate = self.wait_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn cancel(&self, _target: &Target, _run_id: &str) -> Result<bool, RemoteError> {
        self.record("cancel");
        match self.cancel_result.lock().unwrap().clone() {
            None => Ok(true),
            Some(Ok(b)) => Ok(b),
            Some(Err(reason)) => Err(RemoteError::RequestFailed {
                operation: "cancel".into(),
                reason,
            }),
        }
    }

    async fn console_output(
        &self,
        _target: &Target,
        _run_id: &str,
    ) -> Result<ConsoleOutput, RemoteError> {
        self.record("console_output");
        Ok(self.console.lock().unwrap().clone())
    }

    async fn download(&self, _kind: DataKind, id: &str) -> Result<Vec<u8>, RemoteError> {
        self.record("download");
        self.content
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound {
                entity: "dataset".into(),
                id: id.to_string(),
            })
    }
}
