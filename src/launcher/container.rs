use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;

use crate::cluster::Cluster;
use crate::config::LauncherConfig;
use crate::error::{NotegridError, Result};
use crate::launcher::{free_port, LaunchRequest};
use crate::process::{ProcessHandle, Supervisor};

/// Starts the backend inside a Docker container and waits for its service
/// port to come up.
pub struct ContainerLauncher {
    config: LauncherConfig,
    cluster: Option<Cluster>,
}

impl ContainerLauncher {
    pub fn new(config: LauncherConfig, cluster: Option<Cluster>) -> Self {
        Self { config, cluster }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        let host_port = free_port()?;
        let args = self.build_run_args(request, host_port);

        tracing::info!(
            group_id = %request.group_id,
            image = %self.config.container.image,
            host_port,
            "Starting backend container"
        );

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| NotegridError::Launch(format!("docker not runnable: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(NotegridError::Launch(format!(
                "container start failed: {}",
                stderr.trim()
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        // The container is up; now wait for the backend service inside it
        let timeout_ms = self.config.container.launch_timeout_ms;
        if !wait_for_port(host_port, timeout_ms).await {
            tracing::warn!(
                container = %container_id,
                host_port,
                "Backend service did not come up, removing container"
            );
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output()
                .await;
            return Err(NotegridError::LaunchTimeout(timeout_ms));
        }

        Ok(ProcessHandle::owned(
            &request.group_id,
            &request.setting_name,
            "127.0.0.1",
            host_port,
            request.connect_timeout_ms,
            request.impersonated,
            Supervisor::Container { id: container_id },
            self.cluster.clone(),
        ))
    }

    /// Assemble the `docker run` argument vector: detached, named after
    /// the group, resource-limited, with the working and repo dirs
    /// mounted.
    fn build_run_args(&self, request: &LaunchRequest, host_port: u16) -> Vec<String> {
        let container = &self.config.container;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name=notegrid-{}", request.group_id),
            format!("-p={}:{}", host_port, container.service_port),
        ];

        // Request limits win over the configured defaults
        let memory = request
            .memory_limit
            .as_ref()
            .or(container.memory_limit.as_ref());
        if let Some(limit) = memory {
            args.push(format!("--memory={}", limit));
        }
        let cpu = request.cpu_limit.as_ref().or(container.cpu_limit.as_ref());
        if let Some(limit) = cpu {
            args.push(format!("--cpus={}", limit));
        }

        let working_dir = request.working_dir(&self.config);
        args.push(format!(
            "-v={}:/notegrid/work",
            working_dir.display()
        ));
        let repo_dir = request.local_repo_dir(&self.config);
        args.push(format!("-v={}:/notegrid/local-repo", repo_dir.display()));

        args.push(format!("-e=NOTEGRID_GROUP_ID={}", request.group_id));
        args.push(format!("-e=NOTEGRID_PORT={}", container.service_port));
        args.push(format!("-e=NOTEGRID_USER={}", request.user));
        for (key, value) in self.config.env.iter().chain(request.env.iter()) {
            args.push(format!("-e={}={}", key, value));
        }

        args.push(container.image.clone());
        args
    }
}

/// Poll until a TCP connect to the port succeeds or the timeout elapses.
async fn wait_for_port(port: u16, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
