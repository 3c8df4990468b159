pub mod cluster;
pub mod container;
pub mod local;
pub mod resource;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::cluster::Cluster;
use crate::config::{LaunchMode, LauncherConfig};
use crate::error::Result;
use crate::process::ProcessHandle;

pub use cluster::ClusterLauncher;
pub use container::ContainerLauncher;
pub use local::LocalLauncher;
pub use resource::ResourceLauncher;

/// Everything a strategy needs to start (or find) a backend process for
/// one group: identity, credentials, resource limits and the
/// deployment-specific paths.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Identity of the backend group this process will serve
    pub group_id: String,
    /// Human-facing setting name; also names the working directory
    pub setting_name: String,
    /// Setting id; names the local artifact repo directory
    pub setting_id: String,
    pub user: String,
    /// Run the backend as `user` instead of the service account
    pub impersonated: bool,
    pub connect_timeout_ms: u64,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    /// Extra environment for the backend process
    pub env: HashMap<String, String>,
}

impl LaunchRequest {
    pub fn new(group_id: &str, setting_name: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            setting_name: setting_name.to_string(),
            setting_id: setting_name.to_string(),
            user: "anonymous".to_string(),
            impersonated: false,
            connect_timeout_ms: 30_000,
            memory_limit: None,
            cpu_limit: None,
            env: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user: &str, impersonated: bool) -> Self {
        self.user = user.to_string();
        self.impersonated = impersonated;
        self
    }

    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_limits(mut self, memory: Option<String>, cpu: Option<String>) -> Self {
        self.memory_limit = memory;
        self.cpu_limit = cpu;
        self
    }

    /// Working directory for this setting under the configured root
    pub fn working_dir(&self, config: &LauncherConfig) -> PathBuf {
        config.working_root.join(&self.setting_name)
    }

    /// Local artifact repo for this setting under the configured root
    pub fn local_repo_dir(&self, config: &LauncherConfig) -> PathBuf {
        config.local_repo_root.join(&self.setting_id)
    }
}

/// Launch strategy, selected at configuration time. Every variant honors
/// the same contract: `launch(request) -> ProcessHandle`.
pub enum Launcher {
    Local(LocalLauncher),
    Containerized(ContainerLauncher),
    ResourceManaged(ResourceLauncher),
    ClusterAware(Box<ClusterLauncher>),
}

impl Launcher {
    /// Build the configured strategy. With a cluster handle the strategy
    /// is wrapped cluster-aware, so existing live processes are reused
    /// before anything is spawned.
    pub fn from_config(config: &LauncherConfig, cluster: Option<Cluster>) -> Self {
        let inner = match config.mode {
            LaunchMode::Local => {
                Launcher::Local(LocalLauncher::new(config.clone(), cluster.clone()))
            }
            LaunchMode::Containerized => {
                Launcher::Containerized(ContainerLauncher::new(config.clone(), cluster.clone()))
            }
            LaunchMode::ResourceManaged => {
                Launcher::ResourceManaged(ResourceLauncher::new(config.clone(), cluster.clone()))
            }
        };

        match cluster {
            Some(cluster) => Launcher::ClusterAware(Box::new(ClusterLauncher::new(cluster, inner))),
            None => inner,
        }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        match self {
            Launcher::Local(launcher) => launcher.launch(request).await,
            Launcher::Containerized(launcher) => launcher.launch(request).await,
            Launcher::ResourceManaged(launcher) => launcher.launch(request).await,
            Launcher::ClusterAware(launcher) => launcher.launch(request).await,
        }
    }
}

/// Ask the OS for a free loopback port. The tiny window between drop and
/// reuse is tolerated, matching how backend runners pick their ports.
pub(crate) fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
