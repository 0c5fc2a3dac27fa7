//! Galaxy REST implementation of [`RemoteService`].
//!
//! Tools run as jobs (`/api/jobs`), workflows as invocations
//! (`/api/invocations`). Response parsing lives in free functions so it can
//! be tested without a server.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tokio::time::Instant;

use crate::binder::Bindings;
use crate::config::GalaxyConfig;
use crate::error::RemoteError;
use crate::remote::{
    ConsoleOutput, DataKind, OutputEntry, RemoteRun, RemoteService, RemoteStatus, Target,
    TargetKind, TargetMetadata,
};
use crate::state::WorkState;

const API_KEY_HEADER: &str = "x-api-key";
const UPLOAD_TOOL: &str = "upload1";

/// HTTP client for one Galaxy server.
pub struct GalaxyClient {
    base_url: String,
    api_key: SecretString,
    wait_interval: Duration,
    max_wait: Duration,
    client: reqwest::Client,
}

impl GalaxyClient {
    pub fn new(config: &GalaxyConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::RequestFailed {
                operation: "build http client".into(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            wait_interval: config.wait_interval,
            max_wait: config.max_wait,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let resp = request
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| RemoteError::RequestFailed {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let path = resp.url().path().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(operation, &path, status.as_u16(), body));
        }
        Ok(resp)
    }

    async fn json(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, RemoteError> {
        self.execute(operation, request)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get(&self, operation: &str, path: &str) -> Result<Value, RemoteError> {
        self.json(operation, self.client.get(self.api_url(path))).await
    }

    /// Poll `check` until it reports done, up to `max_wait`.
    async fn poll_until<F, Fut>(&self, id: &str, mut check: F) -> Result<(), RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, RemoteError>>,
    {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if check().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RemoteError::Timeout {
                    id: id.to_string(),
                    timeout: self.max_wait,
                });
            }
            tokio::time::sleep(self.wait_interval).await;
        }
    }

    async fn dataset_ready(&self, id: &str) -> Result<bool, RemoteError> {
        let info = self.get("show dataset", &format!("datasets/{id}")).await?;
        match info.get("state").and_then(Value::as_str) {
            Some("ok") => Ok(true),
            Some(state @ ("error" | "failed_metadata" | "discarded" | "deferred")) => {
                Err(RemoteError::Upload {
                    path: id.to_string(),
                    reason: format!("dataset ended in state {state}"),
                })
            }
            _ => Ok(false),
        }
    }

    async fn workflow_details(&self, id: &str) -> Result<WorkflowLabels, RemoteError> {
        let details = self.get("show workflow", &format!("workflows/{id}")).await?;
        Ok(parse_workflow_labels(&details))
    }

    async fn invocation_status(&self, id: &str) -> Result<RemoteStatus, RemoteError> {
        let details = self.get("show invocation", &format!("invocations/{id}")).await?;
        let mut status = parse_status("show invocation", &details)?;
        status.state = normalize_invocation_state(&status.state);

        // "scheduled" only means every step was queued; the jobs decide.
        if status.state == "scheduled" {
            let summary = self
                .get("invocation jobs summary", &format!("invocations/{id}/jobs_summary"))
                .await?;
            if let Some(state) = summarize_jobs(&summary) {
                status.state = state.to_string();
            }
        }
        Ok(status)
    }

    async fn job_console(&self, id: &str) -> Result<ConsoleOutput, RemoteError> {
        let job = self
            .json(
                "show job",
                self.client
                    .get(self.api_url(&format!("jobs/{id}")))
                    .query(&[("full", "true")]),
            )
            .await?;
        Ok(parse_console(&job))
    }
}

#[async_trait]
impl RemoteService for GalaxyClient {
    async fn get_or_create_store(&self, name: &str) -> Result<String, RemoteError> {
        let existing = self
            .json(
                "list histories",
                self.client
                    .get(self.api_url("histories"))
                    .query(&[("name", name)]),
            )
            .await?;
        if let Some(id) = first_id(&existing) {
            tracing::debug!(store = %name, id = %id, "Using existing history");
            return Ok(id);
        }

        let created = self
            .json(
                "create history",
                self.client
                    .post(self.api_url("histories"))
                    .json(&json!({ "name": name })),
            )
            .await?;
        let id = string_field(&created, "id").ok_or_else(|| RemoteError::InvalidResponse {
            operation: "create history".into(),
            reason: "missing id".into(),
        })?;
        tracing::info!(store = %name, id = %id, "Created history");
        Ok(id)
    }

    async fn target_metadata(&self, target: &Target) -> Result<TargetMetadata, RemoteError> {
        match target.kind {
            TargetKind::Tool => {
                let tool = self
                    .json(
                        "show tool",
                        self.client
                            .get(self.api_url(&format!("tools/{}", target.id)))
                            .query(&[("io_details", "true")]),
                    )
                    .await?;
                Ok(TargetMetadata {
                    inputs: parse_tool_inputs(&tool),
                    steps: Vec::new(),
                })
            }
            TargetKind::Workflow => {
                let labels = self.workflow_details(&target.id).await?;
                Ok(TargetMetadata {
                    inputs: labels.inputs.into_iter().map(|(label, _)| label).collect(),
                    steps: labels.steps.into_iter().map(|(label, _)| label).collect(),
                })
            }
        }
    }

    async fn upload_dataset(&self, store_id: &str, path: &Path) -> Result<String, RemoteError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let bytes = tokio::fs::read(path).await?;

        let inputs = json!({
            "files_0|NAME": file_name,
            "files_0|type": "upload_dataset",
            "dbkey": "?",
            "file_type": "auto",
        });
        let form = Form::new()
            .text("tool_id", UPLOAD_TOOL)
            .text("history_id", store_id.to_string())
            .text("inputs", inputs.to_string())
            .part("files_0|file_data", Part::bytes(bytes).file_name(file_name));

        let resp = self
            .json(
                "upload dataset",
                self.client.post(self.api_url("tools")).multipart(form),
            )
            .await
            .map_err(|e| RemoteError::Upload {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let id = parse_upload(&resp).ok_or_else(|| RemoteError::Upload {
            path: path.display().to_string(),
            reason: "response has no output dataset".into(),
        })?;

        let pending = id.as_str();
        self.poll_until(pending, move || self.dataset_ready(pending)).await?;
        tracing::debug!(path = %path.display(), id = %id, "Dataset uploaded");
        Ok(id)
    }

    async fn upload_collection(
        &self,
        store_id: &str,
        name: &str,
        paths: &[PathBuf],
    ) -> Result<String, RemoteError> {
        let uploads = paths.iter().map(|p| self.upload_dataset(store_id, p));
        let ids = futures::future::try_join_all(uploads).await?;

        let elements: Vec<Value> = paths
            .iter()
            .zip(&ids)
            .map(|(path, id)| {
                let element = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| id.clone());
                json!({ "name": element, "src": DataKind::Dataset.src(), "id": id })
            })
            .collect();
        let body = json!({
            "type": "dataset_collection",
            "collection_type": "list",
            "name": name,
            "element_identifiers": elements,
        });

        let created = self
            .json(
                "create collection",
                self.client
                    .post(self.api_url(&format!("histories/{store_id}/contents")))
                    .json(&body),
            )
            .await?;
        string_field(&created, "id").ok_or_else(|| RemoteError::InvalidResponse {
            operation: "create collection".into(),
            reason: "missing id".into(),
        })
    }

    async fn invoke(
        &self,
        target: &Target,
        store_id: &str,
        bindings: &Bindings,
    ) -> Result<RemoteRun, RemoteError> {
        let operation = format!("invoke {target}");
        match target.kind {
            TargetKind::Tool => {
                let body = tool_payload(&target.id, store_id, bindings);
                let resp = self
                    .json(&operation, self.client.post(self.api_url("tools")).json(&body))
                    .await?;
                parse_tool_run(&operation, &resp)
            }
            TargetKind::Workflow => {
                let labels = self.workflow_details(&target.id).await?;
                let body = workflow_payload(store_id, bindings, &labels);
                let resp = self
                    .json(
                        &operation,
                        self.client
                            .post(self.api_url(&format!("workflows/{}/invocations", target.id)))
                            .json(&body),
                    )
                    .await?;
                parse_invocation_run(&operation, &resp)
            }
        }
    }

    async fn status(&self, target: &Target, run_id: &str) -> Result<RemoteStatus, RemoteError> {
        match target.kind {
            TargetKind::Tool => {
                let job = self.get("show job", &format!("jobs/{run_id}")).await?;
                parse_status("show job", &job)
            }
            TargetKind::Workflow => self.invocation_status(run_id).await,
        }
    }

    async fn wait_for_terminal(&self, target: &Target, run_id: &str) -> Result<(), RemoteError> {
        self.poll_until(run_id, move || async move {
            let status = self.status(target, run_id).await?;
            Ok::<_, RemoteError>(WorkState::from_remote(&status.state).is_terminal())
        })
        .await
    }

    async fn cancel(&self, target: &Target, run_id: &str) -> Result<bool, RemoteError> {
        let path = match target.kind {
            TargetKind::Tool => format!("jobs/{run_id}"),
            TargetKind::Workflow => format!("invocations/{run_id}"),
        };
        let resp = self
            .json("cancel", self.client.delete(self.api_url(&path)))
            .await?;
        // Jobs answer with a bare boolean, invocations with their details.
        Ok(resp.as_bool().unwrap_or(true))
    }

    async fn console_output(
        &self,
        target: &Target,
        run_id: &str,
    ) -> Result<ConsoleOutput, RemoteError> {
        match target.kind {
            TargetKind::Tool => self.job_console(run_id).await,
            TargetKind::Workflow => {
                let jobs = self
                    .json(
                        "list invocation jobs",
                        self.client
                            .get(self.api_url("jobs"))
                            .query(&[("invocation_id", run_id)]),
                    )
                    .await?;
                let ids = list_ids(&jobs);
                let outputs =
                    futures::future::try_join_all(ids.iter().map(|id| self.job_console(id)))
                        .await?;
                Ok(join_console(outputs))
            }
        }
    }

    async fn download(&self, kind: DataKind, id: &str) -> Result<Vec<u8>, RemoteError> {
        let path = match kind {
            DataKind::Dataset => format!("datasets/{id}/display"),
            DataKind::Collection => format!("dataset_collections/{id}/download"),
        };
        let resp = self
            .execute("download", self.client.get(self.api_url(&path)))
            .await?;
        let bytes = resp.bytes().await.map_err(|e| RemoteError::InvalidResponse {
            operation: "download".into(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Input and step labels of a workflow, with the ids Galaxy keys them by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct WorkflowLabels {
    /// Input label → input index.
    inputs: Vec<(String, String)>,
    /// Step label → step id.
    steps: Vec<(String, String)>,
}

impl WorkflowLabels {
    fn input_id(&self, label: &str) -> Option<&str> {
        lookup(&self.inputs, label)
    }

    fn step_id(&self, label: &str) -> Option<&str> {
        lookup(&self.steps, label)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], label: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(l, _)| l == label)
        .map(|(_, id)| id.as_str())
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_id(list: &Value) -> Option<String> {
    list.as_array()?.first().and_then(|v| string_field(v, "id"))
}

fn list_ids(list: &Value) -> Vec<String> {
    list.as_array()
        .map(|items| items.iter().filter_map(|v| string_field(v, "id")).collect())
        .unwrap_or_default()
}

fn parse_upload(resp: &Value) -> Option<String> {
    resp.get("outputs")?.as_array()?.first().and_then(|o| string_field(o, "id"))
}

/// Flatten a tool's nested inputs into `|`-joined names.
fn parse_tool_inputs(tool: &Value) -> Vec<String> {
    let mut names = IndexSet::new();
    if let Some(inputs) = tool.get("inputs").and_then(Value::as_array) {
        collect_tool_inputs(inputs, "", &mut names);
    }
    names.into_iter().collect()
}

fn collect_tool_inputs(inputs: &[Value], prefix: &str, names: &mut IndexSet<String>) {
    for input in inputs {
        let Some(name) = input.get("name").and_then(Value::as_str) else {
            continue;
        };
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}|{name}")
        };

        match input.get("type").and_then(Value::as_str) {
            Some("section") => {
                if let Some(children) = input.get("inputs").and_then(Value::as_array) {
                    collect_tool_inputs(children, &path, names);
                }
            }
            Some("conditional") => {
                let test = input
                    .get("test_param")
                    .and_then(|t| t.get("name"))
                    .and_then(Value::as_str);
                if let Some(test) = test {
                    names.insert(format!("{path}|{test}"));
                }
                let cases = input.get("cases").and_then(Value::as_array);
                for case in cases.into_iter().flatten() {
                    if let Some(children) = case.get("inputs").and_then(Value::as_array) {
                        collect_tool_inputs(children, &path, names);
                    }
                }
            }
            _ => {
                names.insert(path);
            }
        }
    }
}

fn parse_workflow_labels(details: &Value) -> WorkflowLabels {
    WorkflowLabels {
        inputs: labelled(details, "inputs", |key, _| Some(key.to_string())),
        steps: labelled(details, "steps", |key, step| {
            string_field(step, "id").or_else(|| Some(key.to_string()))
        }),
    }
}

/// Entries of `details[key]` that carry a label, paired with their id.
fn labelled<F>(details: &Value, key: &str, id_of: F) -> Vec<(String, String)>
where
    F: Fn(&str, &Value) -> Option<String>,
{
    let Some(entries) = details.get(key).and_then(Value::as_object) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(k, v)| {
            let label = v.get("label").and_then(Value::as_str)?;
            Some((label.to_string(), id_of(k, v)?))
        })
        .collect()
}

fn tool_payload(tool_id: &str, store_id: &str, bindings: &Bindings) -> Value {
    let mut inputs = Map::new();
    for (label, binding) in &bindings.inputs {
        inputs.insert(label.clone(), json!({ "src": binding.kind.src(), "id": binding.id }));
    }
    for (label, value) in &bindings.steps {
        inputs.insert(label.clone(), value.clone());
    }
    json!({
        "tool_id": tool_id,
        "history_id": store_id,
        "inputs": inputs,
    })
}

fn workflow_payload(store_id: &str, bindings: &Bindings, labels: &WorkflowLabels) -> Value {
    let mut inputs = Map::new();
    let mut parameters = Map::new();

    for (label, binding) in &bindings.inputs {
        let key = labels.input_id(label).unwrap_or(label);
        inputs.insert(key.to_string(), json!({ "src": binding.kind.src(), "id": binding.id }));
    }
    for (label, value) in &bindings.steps {
        if let Some(step) = labels.step_id(label) {
            parameters.insert(step.to_string(), value.clone());
        } else {
            let key = labels.input_id(label).unwrap_or(label);
            inputs.insert(key.to_string(), value.clone());
        }
    }

    json!({
        "history_id": store_id,
        "inputs": inputs,
        "parameters": parameters,
        "parameters_normalized": false,
    })
}

fn parse_tool_run(operation: &str, resp: &Value) -> Result<RemoteRun, RemoteError> {
    let job = resp
        .get("jobs")
        .and_then(Value::as_array)
        .and_then(|jobs| jobs.first())
        .ok_or_else(|| RemoteError::InvalidResponse {
            operation: operation.to_string(),
            reason: "no job was created".into(),
        })?;
    parse_invocation_run(operation, job)
}

fn parse_invocation_run(operation: &str, resp: &Value) -> Result<RemoteRun, RemoteError> {
    let run_id = string_field(resp, "id").ok_or_else(|| RemoteError::InvalidResponse {
        operation: operation.to_string(),
        reason: "missing id".into(),
    })?;
    let status = string_field(resp, "state").unwrap_or_else(|| "new".into());
    Ok(RemoteRun { run_id, status })
}

fn parse_status(operation: &str, details: &Value) -> Result<RemoteStatus, RemoteError> {
    let state = string_field(details, "state").ok_or_else(|| RemoteError::InvalidResponse {
        operation: operation.to_string(),
        reason: "missing state".into(),
    })?;
    Ok(RemoteStatus {
        state,
        outputs: parse_outputs(details, "outputs", DataKind::Dataset),
        output_collections: parse_outputs(details, "output_collections", DataKind::Collection),
    })
}

/// Named outputs of the given kind. Entries with another `src` are skipped.
fn parse_outputs(details: &Value, key: &str, kind: DataKind) -> Vec<OutputEntry> {
    let Some(entries) = details.get(key).and_then(Value::as_object) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|(_, info)| info.get("src").and_then(Value::as_str) == Some(kind.src()))
        .filter_map(|(name, info)| {
            Some(OutputEntry {
                name: name.clone(),
                id: string_field(info, "id")?,
            })
        })
        .collect()
}

fn normalize_invocation_state(state: &str) -> String {
    match state {
        "cancelling" => "cancelled".into(),
        other => other.to_string(),
    }
}

/// Overall state of a scheduled invocation from its job state counts.
fn summarize_jobs(summary: &Value) -> Option<&'static str> {
    let states = summary.get("states")?.as_object()?;
    let count = |names: &[&str]| -> u64 {
        names
            .iter()
            .filter_map(|n| states.get(*n))
            .filter_map(Value::as_u64)
            .sum()
    };

    if count(&["error", "failed"]) > 0 {
        Some("error")
    } else if count(&["deleted", "deleting", "stopped"]) > 0 {
        Some("cancelled")
    } else if count(&["running"]) > 0 {
        Some("running")
    } else if count(&["paused"]) > 0 {
        Some("paused")
    } else if count(&["new", "queued", "waiting", "upload"]) > 0 {
        Some("queued")
    } else if count(&["ok", "skipped"]) > 0 {
        Some("ok")
    } else {
        None
    }
}

fn parse_console(job: &Value) -> ConsoleOutput {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| job.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };
    ConsoleOutput {
        stdout: text(&["tool_stdout", "stdout"]),
        stderr: text(&["tool_stderr", "stderr"]),
    }
}

fn join_console(outputs: Vec<ConsoleOutput>) -> ConsoleOutput {
    let join = |parts: Vec<String>| {
        parts
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let (stdout, stderr): (Vec<String>, Vec<String>) =
        outputs.into_iter().map(|o| (o.stdout, o.stderr)).unzip();
    ConsoleOutput {
        stdout: join(stdout),
        stderr: join(stderr),
    }
}

/// Error for a non-success response. A 404 names the missing resource by its
/// API path, e.g. `jobs/j1`.
fn status_error(operation: &str, path: &str, status: u16, body: String) -> RemoteError {
    if status == 404 {
        let resource = path.split_once("/api/").map_or(path, |(_, rest)| rest);
        return RemoteError::NotFound {
            entity: operation.to_string(),
            id: resource.trim_matches('/').to_string(),
        };
    }
    RemoteError::Status {
        operation: operation.to_string(),
        status,
        body,
    }
}
