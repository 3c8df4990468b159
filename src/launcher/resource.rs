use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cluster::Cluster;
use crate::config::LauncherConfig;
use crate::error::{NotegridError, Result};
use crate::launcher::LaunchRequest;
use crate::process::{ProcessHandle, Supervisor};

#[derive(Debug, Serialize)]
struct SubmitApplication<'a> {
    name: String,
    queue: &'a str,
    group_id: &'a str,
    user: &'a str,
    memory: Option<&'a str>,
    cores: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApplicationInfo {
    id: String,
    state: String,
    host: Option<String>,
    port: Option<u16>,
    diagnostics: Option<String>,
}

/// Submits the backend as an application to an external resource manager
/// and discovers the allocated endpoint through its tracking API.
pub struct ResourceLauncher {
    config: LauncherConfig,
    cluster: Option<Cluster>,
    http: reqwest::Client,
}

impl ResourceLauncher {
    pub fn new(config: LauncherConfig, cluster: Option<Cluster>) -> Self {
        Self {
            config,
            cluster,
            http: reqwest::Client::new(),
        }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        let manager = &self.config.resource_manager;
        let submit = SubmitApplication {
            name: format!("notegrid-{}", request.group_id),
            queue: &manager.queue,
            group_id: &request.group_id,
            user: &request.user,
            memory: request.memory_limit.as_deref(),
            cores: request.cpu_limit.as_deref(),
        };

        let app: ApplicationInfo = self
            .http
            .post(format!("{}/v1/applications", manager.endpoint))
            .timeout(Duration::from_secs(10))
            .json(&submit)
            .send()
            .await
            .map_err(|e| NotegridError::Launch(format!("application submission failed: {}", e)))?
            .error_for_status()
            .map_err(|e| NotegridError::Launch(format!("application rejected: {}", e)))?
            .json()
            .await
            .map_err(|e| NotegridError::Launch(format!("bad submission response: {}", e)))?;

        tracing::info!(
            group_id = %request.group_id,
            application = %app.id,
            "Submitted backend application to resource manager"
        );

        match self.track_allocation(&app.id, manager.launch_timeout_ms).await {
            Ok((host, port)) => Ok(ProcessHandle::owned(
                &request.group_id,
                &request.setting_name,
                &host,
                port,
                request.connect_timeout_ms,
                request.impersonated,
                Supervisor::Application {
                    id: app.id,
                    manager_endpoint: manager.endpoint.clone(),
                },
                self.cluster.clone(),
            )),
            Err(e) => {
                // Best effort: don't leave the allocation behind
                let _ = self
                    .http
                    .delete(format!("{}/v1/applications/{}", manager.endpoint, app.id))
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    /// Poll the tracking API until the application is running with a
    /// known endpoint, it fails, or the launch timeout elapses.
    async fn track_allocation(&self, app_id: &str, timeout_ms: u64) -> Result<(String, u16)> {
        let manager = &self.config.resource_manager;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let info: ApplicationInfo = self
                .http
                .get(format!("{}/v1/applications/{}", manager.endpoint, app_id))
                .timeout(Duration::from_secs(5))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match info.state.as_str() {
                "running" => {
                    if let (Some(host), Some(port)) = (info.host, info.port) {
                        tracing::info!(application = %app_id, host = %host, port, "Backend allocation running");
                        return Ok((host, port));
                    }
                }
                "failed" | "killed" => {
                    return Err(NotegridError::Launch(format!(
                        "allocation failed: {}",
                        info.diagnostics.unwrap_or_else(|| info.state.clone())
                    )));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(NotegridError::LaunchTimeout(timeout_ms));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
