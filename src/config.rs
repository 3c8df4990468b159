use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Configuration for container-based backend launches.
///
/// Backend processes launched in containerized mode run inside Docker with
/// resource limits applied.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker image to use for the backend process
    pub image: String,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.0" for one CPU)
    pub cpu_limit: Option<String>,
    /// Port the backend service listens on inside the container
    pub service_port: u16,
    /// How long to poll the service port before giving up (ms)
    pub launch_timeout_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "notegrid/backend:latest".to_string(),
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
            service_port: 9400,
            launch_timeout_ms: 30_000,
        }
    }
}

/// Configuration for resource-manager-based backend launches.
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Base URL of the resource manager's application API
    pub endpoint: String,
    /// How long to poll the tracking API for an allocation (ms)
    pub launch_timeout_ms: u64,
    /// Queue/pool name to submit applications under
    pub queue: String,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8088".to_string(),
            launch_timeout_ms: 60_000,
            queue: "default".to_string(),
        }
    }
}

/// Which launch strategy a node uses when a backend process must be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Local,
    Containerized,
    ResourceManaged,
}

/// Launcher-wide configuration shared by all strategies.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub mode: LaunchMode,
    /// Path of the backend runner binary (local mode)
    pub runner_path: PathBuf,
    /// Root under which per-setting working dirs live
    pub working_root: PathBuf,
    /// Root under which per-setting local artifact repos live
    pub local_repo_root: PathBuf,
    pub container: ContainerConfig,
    pub resource_manager: ResourceManagerConfig,
    /// Default connect timeout for freshly launched processes (ms)
    pub connect_timeout_ms: u64,
    /// Extra environment passed to every launched backend
    pub env: HashMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Local,
            runner_path: PathBuf::from("bin/notegrid-backend"),
            working_root: PathBuf::from("backends"),
            local_repo_root: PathBuf::from("local-repo"),
            container: ContainerConfig::default(),
            resource_manager: ResourceManagerConfig::default(),
            connect_timeout_ms: 30_000,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Heartbeats older than `eviction_factor * heartbeat_interval_ms`
    /// mark the entry's owner as dead.
    pub eviction_factor: u32,
    /// How long `Cluster::start` waits for a known leader before failing
    pub bootstrap_timeout_ms: u64,
    /// How long a leader waits for majority replication of a write
    pub replication_timeout_ms: u64,
    /// Bounded retry attempts for leader-routed metadata writes
    pub meta_write_attempts: u32,
    /// Idle lifetime after which an unreferenced shared handle is evicted (ms)
    pub handle_idle_timeout_ms: u64,
    /// Grace period for cooperative job cancellation (ms)
    pub cancel_grace_ms: u64,
    pub launcher: LauncherConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9470"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            eviction_factor: 6,
            bootstrap_timeout_ms: 30_000,
            replication_timeout_ms: 3_000,
            meta_write_attempts: 3,
            handle_idle_timeout_ms: 600_000,
            cancel_grace_ms: 2_000,
            launcher: LauncherConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    /// Staleness cutoff for heartbeat-carrying metadata entries.
    pub fn heartbeat_cutoff_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.eviction_factor as u64
    }
}
