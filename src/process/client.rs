use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NotegridError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_id: Uuid,
    pub code: String,
    /// Merged note/paragraph parameters, visible to the executing code
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecuteStatus,
    pub output: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: Uuid,
}

/// JSON/HTTP client for one backend process endpoint.
///
/// `execute` deliberately has no request timeout: a submit blocks the
/// calling job until the backend answers or the channel breaks.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            http: reqwest::Client::new(),
        }
    }

    /// Liveness probe used by connect's backoff loop
    pub async fn ping(&self) -> Result<()> {
        self.http
            .get(format!("{}/v1/ping", self.base_url))
            .timeout(Duration::from_secs(1))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn execute(&self, req: &ExecuteRequest) -> Result<ExecuteResponse> {
        let resp = self
            .http
            .post(format!("{}/v1/execute", self.base_url))
            .json(req)
            .send()
            .await
            .map_err(|e| NotegridError::BackendUnreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| NotegridError::BackendUnreachable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| NotegridError::BackendUnreachable(e.to_string()))
    }

    /// Ask the backend to interrupt a running job. The caller bounds this
    /// with the cancellation grace period.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.http
            .post(format!("{}/v1/cancel", self.base_url))
            .json(&CancelRequest { job_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
