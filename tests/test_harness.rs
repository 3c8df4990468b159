//! Test harness for multi-node cluster integration tests.
//!
//! Provides utilities for spawning, managing, and partitioning in-process
//! member clusters on loopback ports.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use notegrid::cluster::{Cluster, ClusterMetaEntry, ClusterMetaType};
use notegrid::config::{NodeConfig, PeerConfig};

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64, port: u16, peers: Vec<(u64, u16)>) -> NodeConfig {
    let peer_configs: Vec<PeerConfig> = peers
        .into_iter()
        .map(|(id, p)| PeerConfig {
            node_id: id,
            addr: format!("127.0.0.1:{}", p),
        })
        .collect();

    let listen_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    NodeConfig {
        node_id,
        listen_addr,
        peers: peer_configs,
        // Shorter timeouts for faster tests
        election_timeout_min_ms: 50,
        election_timeout_max_ms: 100,
        heartbeat_interval_ms: 20,
        eviction_factor: 20,
        bootstrap_timeout_ms: 10_000,
        replication_timeout_ms: 1_000,
        meta_write_attempts: 3,
        handle_idle_timeout_ms: 60_000,
        cancel_grace_ms: 500,
        ..Default::default()
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    #[allow(dead_code)]
    pub port: u16,
    pub cluster: Cluster,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.cluster.is_leader().await
    }

    #[allow(dead_code)]
    pub async fn leader_id(&self) -> Option<u64> {
        self.cluster.leader_id().await
    }

    /// Local (possibly stale) view of a meta bucket
    #[allow(dead_code)]
    pub async fn local_meta(
        &self,
        meta_type: ClusterMetaType,
        prefix: &str,
    ) -> HashMap<String, ClusterMetaEntry> {
        self.cluster.get_meta_local(meta_type, prefix).await
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    #[allow(dead_code)]
    base_port: u16,
}

impl TestCluster {
    /// Create and start a cluster with n nodes on consecutive ports
    pub async fn new(num_nodes: usize, base_port: u16) -> Self {
        let mut cluster = Self {
            nodes: HashMap::new(),
            base_port,
        };

        let all_peers: Vec<(u64, u16)> = (0..num_nodes)
            .map(|i| ((i + 1) as u64, base_port + i as u16))
            .collect();

        let mut joins = Vec::new();
        for i in 0..num_nodes {
            let node_id = (i + 1) as u64;
            let port = base_port + i as u16;
            let peers: Vec<(u64, u16)> = all_peers
                .iter()
                .filter(|(id, _)| *id != node_id)
                .copied()
                .collect();

            let config = test_node_config(node_id, port, peers);
            let (member, raft_rx) = Cluster::new(config);
            let starter = member.clone();
            // Bootstrap blocks until a leader is known, so every member
            // must be starting concurrently
            joins.push(tokio::spawn(async move { starter.start(raft_rx).await }));
            cluster.nodes.insert(
                node_id,
                TestNode {
                    node_id,
                    port,
                    cluster: member,
                },
            );
        }

        for join in joins {
            join.await
                .expect("bootstrap task panicked")
                .expect("cluster bootstrap failed");
        }

        cluster
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let result = wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    /// The node currently leading, if any
    pub async fn leader_node(&self) -> Option<&TestNode> {
        let leader_id = self.get_leader_id().await?;
        self.get_node(leader_id)
    }

    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Create a network partition: group_a can't communicate with group_b
    pub async fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &node_a in group_a {
            if let Some(node) = self.nodes.get(&node_a) {
                for &node_b in group_b {
                    node.cluster.disconnect_peer(node_b).await;
                }
            }
        }
        for &node_b in group_b {
            if let Some(node) = self.nodes.get(&node_b) {
                for &node_a in group_a {
                    node.cluster.disconnect_peer(node_a).await;
                }
            }
        }
    }

    /// Heal a network partition: restore communication between groups
    pub async fn heal_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &node_a in group_a {
            if let Some(node) = self.nodes.get(&node_a) {
                for &node_b in group_b {
                    node.cluster.reconnect_peer(node_b).await;
                }
            }
        }
        for &node_b in group_b {
            if let Some(node) = self.nodes.get(&node_b) {
                for &node_a in group_a {
                    node.cluster.reconnect_peer(node_a).await;
                }
            }
        }
    }

    /// Isolate a node from all other nodes
    pub async fn isolate_node(&self, node_id: u64) {
        let other_ids: Vec<u64> = self
            .nodes
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect();
        self.create_partition(&[node_id], &other_ids).await;
    }

    /// Heal an isolated node (reconnect to all others)
    #[allow(dead_code)]
    pub async fn heal_node(&self, node_id: u64) {
        let other_ids: Vec<u64> = self
            .nodes
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect();
        self.heal_partition(&[node_id], &other_ids).await;
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<u64> {
        let result = wait_for(
            || async {
                for &node_id in group {
                    if let Some(node) = self.nodes.get(&node_id) {
                        if node.is_leader().await {
                            return true;
                        }
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            for &node_id in group {
                if let Some(node) = self.nodes.get(&node_id) {
                    if node.is_leader().await {
                        return Some(node_id);
                    }
                }
            }
        }
        None
    }

    /// Gracefully take a node out of the group
    #[allow(dead_code)]
    pub async fn shutdown_node(&mut self, node_id: u64) -> bool {
        if let Some(node) = self.nodes.remove(&node_id) {
            node.cluster.shutdown().await;
            true
        } else {
            false
        }
    }

    /// Wait until every listed node's local store has the key
    #[allow(dead_code)]
    pub async fn wait_for_meta_on_nodes(
        &self,
        node_ids: &[u64],
        meta_type: ClusterMetaType,
        key: &str,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for &node_id in node_ids {
                    let Some(node) = self.nodes.get(&node_id) else {
                        return false;
                    };
                    if !node.local_meta(meta_type, "").await.contains_key(key) {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(25),
        )
        .await
    }

    /// Shutdown all nodes (best effort cleanup)
    pub async fn shutdown(&mut self) {
        for (_, node) in self.nodes.drain() {
            node.cluster.shutdown().await;
        }
    }
}

/// In-process stand-in for a backend executor process.
///
/// `/v1/execute` behavior is steered by the submitted code: `fail`
/// anywhere makes it return an error result, `sleep:N` delays the reply
/// by N milliseconds, `params` echoes the submit context as JSON, and
/// anything else succeeds with `ok: {code}`.
#[allow(dead_code)]
pub async fn spawn_backend_stub() -> (u16, tokio::task::JoinHandle<()>) {
    use axum::routing::{get, post};

    async fn execute(
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> axum::Json<serde_json::Value> {
        let code = body["code"].as_str().unwrap_or("").to_string();

        if let Some(ms) = code.strip_prefix("sleep:").and_then(|v| v.parse::<u64>().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let response = if code.contains("fail") {
            serde_json::json!({
                "status": "error",
                "output": null,
                "message": "deliberate failure",
            })
        } else if code.trim() == "params" {
            serde_json::json!({
                "status": "success",
                "output": body["context"].to_string(),
                "message": null,
            })
        } else {
            serde_json::json!({
                "status": "success",
                "output": format!("ok: {}", code),
                "message": null,
            })
        };
        axum::Json(response)
    }

    let router = axum::Router::new()
        .route("/v1/ping", get(|| async { "pong" }))
        .route("/v1/execute", post(execute))
        .route(
            "/v1/cancel",
            post(|| async { axum::http::StatusCode::OK }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (port, task)
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
