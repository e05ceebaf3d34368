//! Client for the service control interface: the three calls a worker
//! makes against a node's endpoint while driving a task
//! (`execute`, `status`, `output`).

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use meshflow_model::{DataReference, EngineError};

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub method: String,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub inputs: Vec<DataReference>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecuteResponse {
    Complete { output: DataReference },
    Running { task_id: String },
    Failed { error: RemoteError },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Running { progress: Option<f32> },
    Complete,
    Failed { error: RemoteError },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

/// A thin, pooled HTTP client over the control interface. Transport
/// failures (unreachable endpoint, non-2xx, malformed body) are folded
/// into [`EngineError::Transport`]; a service-reported `status:
/// "failed"` becomes [`EngineError::Service`] instead, since the
/// service had its chance and declined rather than the network
/// failing it.
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    call_timeout: std::time::Duration,
}

impl ServiceClient {
    pub fn new(call_timeout: std::time::Duration) -> Self {
        ServiceClient {
            http: reqwest::Client::new(),
            call_timeout,
        }
    }

    #[instrument(skip(self, request), fields(endpoint = %endpoint, method = %request.method))]
    pub async fn execute(
        &self,
        endpoint: &str,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, EngineError> {
        let url = format!("{endpoint}/control/execute");
        let response = self
            .http
            .post(&url)
            .timeout(self.call_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::transport(endpoint, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::transport(
                endpoint,
                format!("execute returned {status}: {body}"),
            ));
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| EngineError::transport(endpoint, format!("malformed response: {e}")))?;

        if let ExecuteResponse::Failed { error } = &parsed {
            return Err(EngineError::service(error.message.clone()));
        }
        Ok(parsed)
    }

    #[instrument(skip(self), fields(endpoint = %endpoint, remote_task_id = %remote_task_id))]
    pub async fn status(
        &self,
        endpoint: &str,
        remote_task_id: &str,
    ) -> Result<StatusResponse, EngineError> {
        let url = format!("{endpoint}/control/status/{remote_task_id}");
        let response = self
            .http
            .get(&url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(|e| EngineError::transport(endpoint, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::transport(
                endpoint,
                format!("status returned {status}: {body}"),
            ));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| EngineError::transport(endpoint, format!("malformed response: {e}")))?;

        if let StatusResponse::Failed { error } = &parsed {
            return Err(EngineError::service(error.message.clone()));
        }
        Ok(parsed)
    }

    #[instrument(skip(self), fields(endpoint = %endpoint, remote_task_id = %remote_task_id))]
    pub async fn output(
        &self,
        endpoint: &str,
        remote_task_id: &str,
    ) -> Result<DataReference, EngineError> {
        let url = format!("{endpoint}/control/output/{remote_task_id}");
        let response = self
            .http
            .get(&url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(|e| EngineError::transport(endpoint, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::transport(
                endpoint,
                format!("output returned {status}: {body}"),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::transport(endpoint, format!("malformed output: {e}")))
    }
}
