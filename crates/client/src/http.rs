//! REST backend for a node-graph server.

use async_trait::async_trait;
use groupflow_core::{NodeId, PromptGraph, RunId};
use groupflow_execution::{
    Backend, BackendError, CleanupRequest, JobOutcome, QueueStatus, SubmitReceipt,
};
use reqwest::{Client, ClientBuilder, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const PROMPT: &str = "/prompt";
const QUEUE: &str = "/queue";
const HISTORY: &str = "/history";
const INTERRUPT: &str = "/interrupt";
const CURRENT_GROUP: &str = "/group_executor/current_group";
const RELEASE_PERMISSION: &str = "/group_executor/release_permission";
const CLEANUP: &str = "/group_executor/cleanup";
const PARAM_VALUE: &str = "/group_executor/param_value";
const SAMPLER_NODE_TYPES: &str = "/group_executor/sampler_node_types";

/// [`Backend`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// HTTP client
    client: Client,

    /// Server URL without trailing slash
    base_url: String,

    /// Sent with submitted prompts so the server can route progress events
    client_id: Option<String>,
}

impl HttpBackend {
    /// Create a new backend client with a 30 second request timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(30)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: None,
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    /// Set the client id attached to submitted prompts.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Server URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<String, BackendError> {
        let response = request.send().await.map_err(|e| BackendError::Request {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| BackendError::Request {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let body = self.send(endpoint, request).await?;
        decode(endpoint, &body)
    }
}

fn build_client(timeout: Duration) -> Client {
    ClientBuilder::new()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, BackendError> {
    serde_json::from_str(body).map_err(|e| BackendError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
struct PromptResponse {
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

impl From<QueueResponse> for QueueStatus {
    fn from(queue: QueueResponse) -> Self {
        Self {
            running: queue.queue_running.len(),
            pending: queue.queue_pending.len(),
        }
    }
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    status: Option<HistoryStatus>,
}

#[derive(Deserialize)]
struct HistoryStatus {
    /// `[event, details]` pairs in the order the server emitted them
    #[serde(default)]
    messages: Vec<(String, Value)>,
}

/// Read a job's outcome out of a `/history/{prompt_id}` response.
fn job_outcome_from(prompt_id: &str, mut history: HashMap<String, HistoryEntry>) -> JobOutcome {
    let Some(entry) = history.remove(prompt_id) else {
        return JobOutcome::Unknown;
    };
    let interrupted = entry
        .status
        .into_iter()
        .flat_map(|status| status.messages)
        .find(|(event, _)| event == "execution_interrupted");

    match interrupted {
        Some((_, details)) => JobOutcome::Interrupted {
            reason: interruption_reason(&details),
        },
        None => JobOutcome::Finished,
    }
}

fn interruption_reason(details: &Value) -> String {
    let node_id = details.get("node_id").and_then(|id| match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let node_type = details.get("node_type").and_then(Value::as_str);

    match (node_id, node_type) {
        (Some(id), Some(node_type)) => format!("Interrupted at node {} ({})", id, node_type),
        (Some(id), None) => format!("Interrupted at node {}", id),
        _ => "Interrupted".to_string(),
    }
}

#[derive(Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
struct ParamValueResponse {
    value: bool,
}

#[derive(Deserialize)]
struct SamplerTypesResponse {
    #[serde(alias = "samplerNodeTypes")]
    sampler_node_types: Vec<String>,
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit_job(&self, prompt: &PromptGraph) -> Result<SubmitReceipt, BackendError> {
        let mut payload = json!({ "prompt": prompt });
        if let Some(client_id) = &self.client_id {
            payload["client_id"] = json!(client_id);
        }

        debug!("Submitting prompt with {} nodes", prompt.len());
        let request = self.client.post(self.url(PROMPT)).json(&payload);
        let response: PromptResponse = self.send_json(PROMPT, request).await?;
        Ok(SubmitReceipt {
            prompt_id: response.prompt_id,
        })
    }

    async fn queue_status(&self) -> Result<QueueStatus, BackendError> {
        let request = self.client.get(self.url(QUEUE));
        let queue: QueueResponse = self.send_json(QUEUE, request).await?;
        Ok(queue.into())
    }

    async fn job_outcome(&self, prompt_id: &str) -> Result<JobOutcome, BackendError> {
        let request = self.client.get(format!("{}/{}", self.url(HISTORY), prompt_id));
        let history: HashMap<String, HistoryEntry> = self.send_json(HISTORY, request).await?;
        Ok(job_outcome_from(prompt_id, history))
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        let request = self.client.post(self.url(INTERRUPT));
        self.send(INTERRUPT, request).await.map(|_| ())
    }

    async fn set_current_group(&self, group_name: Option<&str>) -> Result<(), BackendError> {
        let request = self
            .client
            .post(self.url(CURRENT_GROUP))
            .json(&json!({ "group_name": group_name }));
        self.send(CURRENT_GROUP, request).await.map(|_| ())
    }

    async fn release_permission(&self, run_id: &RunId) -> Result<bool, BackendError> {
        let request = self
            .client
            .post(self.url(RELEASE_PERMISSION))
            .json(&json!({ "execution_id": run_id }));
        let response: SuccessResponse = self.send_json(RELEASE_PERMISSION, request).await?;
        Ok(response.success)
    }

    async fn cleanup_memory(&self, request: &CleanupRequest) -> Result<(), BackendError> {
        let http = self.client.post(self.url(CLEANUP)).json(request);
        self.send(CLEANUP, http).await.map(|_| ())
    }

    async fn param_value(&self, node_id: &NodeId, param_name: &str) -> Result<bool, BackendError> {
        let request = self
            .client
            .get(self.url(PARAM_VALUE))
            .query(&[("node_id", node_id.as_str()), ("param_name", param_name)]);
        let response: ParamValueResponse = self.send_json(PARAM_VALUE, request).await?;
        Ok(response.value)
    }

    async fn sampler_node_types(&self) -> Result<Vec<String>, BackendError> {
        let request = self.client.get(self.url(SAMPLER_NODE_TYPES));
        let response: SamplerTypesResponse = self.send_json(SAMPLER_NODE_TYPES, request).await?;
        Ok(response.sampler_node_types)
    }
}
