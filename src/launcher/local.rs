use std::process::Stdio;

use tokio::process::Command;

use crate::cluster::Cluster;
use crate::config::LauncherConfig;
use crate::error::{NotegridError, Result};
use crate::launcher::{free_port, LaunchRequest};
use crate::process::{ProcessHandle, Supervisor};

/// Spawns the backend runner as a local child process and supervises it.
pub struct LocalLauncher {
    config: LauncherConfig,
    cluster: Option<Cluster>,
}

impl LocalLauncher {
    pub fn new(config: LauncherConfig, cluster: Option<Cluster>) -> Self {
        Self { config, cluster }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        let working_dir = request.working_dir(&self.config);
        if !working_dir.is_dir() {
            return Err(NotegridError::Launch(format!(
                "working directory missing: {}",
                working_dir.display()
            )));
        }
        if !self.config.runner_path.is_file() {
            return Err(NotegridError::Launch(format!(
                "runner binary missing: {}",
                self.config.runner_path.display()
            )));
        }

        let port = free_port()?;
        let local_repo = request.local_repo_dir(&self.config);

        // Impersonated backends run as the requesting user
        let mut command = if request.impersonated {
            let mut c = Command::new("sudo");
            c.arg("-u").arg(&request.user).arg(&self.config.runner_path);
            c
        } else {
            Command::new(&self.config.runner_path)
        };

        command
            .current_dir(&working_dir)
            .env("NOTEGRID_GROUP_ID", &request.group_id)
            .env("NOTEGRID_PORT", port.to_string())
            .env("NOTEGRID_LOCAL_REPO", &local_repo)
            .envs(&self.config.env)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| NotegridError::Launch(format!("spawn failed: {}", e)))?;

        tracing::info!(
            group_id = %request.group_id,
            port,
            pid = child.id(),
            runner = %self.config.runner_path.display(),
            "Launched local backend process"
        );

        Ok(ProcessHandle::owned(
            &request.group_id,
            &request.setting_name,
            "127.0.0.1",
            port,
            request.connect_timeout_ms,
            request.impersonated,
            Supervisor::Child(child),
            self.cluster.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn launcher_with(
        runner: PathBuf,
        working_root: PathBuf,
    ) -> LocalLauncher {
        LocalLauncher::new(
            LauncherConfig {
                runner_path: runner,
                working_root,
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn missing_working_dir_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_with(
            PathBuf::from("/bin/sh"),
            dir.path().join("does-not-exist"),
        );

        let err = launcher
            .launch(&LaunchRequest::new("g1", "python"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotegridError::Launch(_)));
        assert!(err.to_string().contains("working directory"));
    }

    #[tokio::test]
    async fn missing_runner_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("python")).unwrap();
        let launcher = launcher_with(
            dir.path().join("no-such-runner"),
            dir.path().to_path_buf(),
        );

        let err = launcher
            .launch(&LaunchRequest::new("g1", "python"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotegridError::Launch(_)));
        assert!(err.to_string().contains("runner binary"));
    }

    #[tokio::test]
    async fn spawn_returns_owned_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("python")).unwrap();
        let launcher = launcher_with(PathBuf::from("/bin/sleep"), dir.path().to_path_buf());

        let mut request = LaunchRequest::new("g1", "python");
        // /bin/sleep wants a duration argument; it still spawns without
        // one and exits, which is all this test needs.
        request.env.insert("UNUSED".to_string(), "1".to_string());

        let handle = launcher.launch(&request).await.unwrap();
        assert!(handle.is_owned());
        assert_eq!(handle.group_id(), "g1");
        assert_eq!(handle.host(), "127.0.0.1");
        assert!(handle.port() > 0);

        handle.close().await.unwrap();
        assert!(handle.is_closed().await);
    }
}
