use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::cluster::{Cluster, ClusterEvent, RaftMessage, NOTE_EVENT_TOPIC};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::launcher::Launcher;
use crate::process::ProcessRegistry;
use crate::scheduler::{BackendResolver, NoteScheduler};

/// Main node that wires the membership layer, the launcher, the process
/// pool and the scheduler together.
pub struct Node {
    pub config: NodeConfig,
    pub cluster: Cluster,
    pub registry: Arc<ProcessRegistry>,
    pub scheduler: NoteScheduler,
    api_addr: Option<SocketAddr>,
    raft_rx: mpsc::Receiver<RaftMessage>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        api_addr: Option<SocketAddr>,
        resolver: Arc<dyn BackendResolver>,
    ) -> Self {
        let (cluster, raft_rx) = Cluster::new(config.clone());
        let registry = Arc::new(ProcessRegistry::new(config.handle_idle_timeout_ms));
        let launcher = Arc::new(Launcher::from_config(
            &config.launcher,
            Some(cluster.clone()),
        ));
        let scheduler = NoteScheduler::new(
            registry.clone(),
            launcher,
            resolver,
            Some(cluster.clone()),
            config.cancel_grace_ms,
        );

        Self {
            config,
            cluster,
            registry,
            scheduler,
            api_addr,
            raft_rx,
        }
    }

    /// Run the node until the shutdown token fires.
    ///
    /// Startup order: join the cluster (blocks until a leader is known),
    /// start the idle sweep, start the API server, then wait for
    /// shutdown and leave the group cleanly.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.cluster.start(self.raft_rx).await?;

        self.registry
            .clone()
            .spawn_idle_sweep(self.cluster.shutdown_token());

        // Observe peers' note activity; the notebook UI collaborator
        // hangs its refresh hooks off this same topic.
        let node_id = self.config.node_id;
        let _note_sub = self.cluster.subscribe(
            NOTE_EVENT_TOPIC,
            Arc::new(move |event: &ClusterEvent| {
                if event.origin_node != node_id {
                    tracing::info!(
                        origin = event.origin_node,
                        payload = %event.payload,
                        "Peer note activity"
                    );
                }
            }),
        );

        if let Some(api_addr) = self.api_addr {
            let state = ApiState {
                cluster: self.cluster.clone(),
                scheduler: self.scheduler.clone(),
            };
            tokio::spawn(run_api(api_addr, state));
        }

        shutdown.cancelled().await;

        tracing::info!(node_id, "Shutting down");
        self.registry.close_all().await;
        self.cluster.shutdown().await;
        Ok(())
    }
}
