use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cluster::event::{ClusterEvent, ClusterEventListener, EventBus, Subscription};
use crate::cluster::meta::{ClusterMetaEntry, ClusterMetaType, MetaStore};
use crate::cluster::node::{RaftMessage, RaftNode};
use crate::cluster::state::{MetaCommand, RaftRole};
use crate::cluster::transport::{cluster_router, NodeStatus, WriteRequest, WriteResponse};
use crate::config::NodeConfig;
use crate::error::{NotegridError, Result};

/// Membership lifecycle of this node. `Left` is terminal and only entered
/// by explicit shutdown; losing contact with peers is not `Left`, it
/// triggers re-election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Joining,
    Serving,
    Left,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Joining => write!(f, "joining"),
            Lifecycle::Serving => write!(f, "serving"),
            Lifecycle::Left => write!(f, "left"),
        }
    }
}

pub struct ClusterInner {
    pub(crate) raft: Arc<RaftNode>,
    config: NodeConfig,
    store: RwLock<MetaStore>,
    bus: EventBus,
    lifecycle: RwLock<Lifecycle>,
    applied_tx: watch::Sender<u64>,
    broadcast_tx: mpsc::UnboundedSender<ClusterEvent>,
    shutdown: CancellationToken,
}

/// Handle to this node's membership layer. Cheap to clone; all clones
/// share one consensus core, metadata store and event bus.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn new(config: NodeConfig) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (raft, raft_rx) = RaftNode::new(config.clone());
        let (applied_tx, _) = watch::channel(0);
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClusterInner {
            raft: Arc::new(raft),
            bus: EventBus::new(config.node_id),
            config,
            store: RwLock::new(MetaStore::new()),
            lifecycle: RwLock::new(Lifecycle::Joining),
            applied_tx,
            broadcast_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(broadcast_loop(inner.clone(), broadcast_rx));

        (Self { inner }, raft_rx)
    }

    pub fn node_id(&self) -> u64 {
        self.inner.config.node_id
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read().await
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.raft.is_leader().await
    }

    pub async fn leader_id(&self) -> Option<u64> {
        self.inner.raft.get_leader_id().await
    }

    /// Join (or bootstrap) the consensus group: bind the member transport,
    /// start the consensus/apply/heartbeat/eviction loops, then block
    /// until a leader is known.
    pub async fn start(&self, raft_rx: mpsc::Receiver<RaftMessage>) -> Result<()> {
        let inner = &self.inner;
        let listener = tokio::net::TcpListener::bind(inner.config.listen_addr).await?;
        tracing::info!(
            node_id = inner.config.node_id,
            addr = %inner.config.listen_addr,
            "Member transport listening"
        );

        let router = cluster_router(inner.clone());
        let server_shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Member transport server failed");
            }
        });

        inner.raft.connect_to_peers().await;

        let raft = inner.raft.clone();
        let raft_shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            raft.run(raft_rx, raft_shutdown).await;
        });

        tokio::spawn(apply_loop(inner.clone()));
        tokio::spawn(server_heartbeat_loop(inner.clone()));
        tokio::spawn(eviction_loop(inner.clone()));

        // Bootstrap: wait until some member is known to lead
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(inner.config.bootstrap_timeout_ms);
        loop {
            if inner.raft.get_leader_id().await.is_some() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NotegridError::ClusterBootstrapTimeout(
                    inner.config.bootstrap_timeout_ms,
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *inner.lifecycle.write().await = Lifecycle::Serving;
        tracing::info!(node_id = inner.config.node_id, "Cluster membership serving");
        Ok(())
    }

    /// Leave the group for good. Deregisters this node's server entry on a
    /// best-effort basis and stops every loop.
    pub async fn shutdown(&self) {
        {
            let lifecycle = self.inner.lifecycle.read().await;
            if *lifecycle == Lifecycle::Left {
                return;
            }
        }

        // Deregister before flipping to Left; a leaving leader can still
        // commit its own removal
        let key = self.node_id().to_string();
        if let Err(e) = self
            .write_once(MetaCommand::RemoveMeta {
                meta_type: ClusterMetaType::ServerMeta,
                key,
            })
            .await
        {
            tracing::debug!(error = %e, "Server deregistration skipped during shutdown");
        }

        *self.inner.lifecycle.write().await = Lifecycle::Left;
        self.inner.shutdown.cancel();
        tracing::info!(node_id = self.node_id(), "Cluster membership left");
    }

    /// Strongly consistent snapshot read, served by or routed through the
    /// current leader.
    pub async fn get_meta(
        &self,
        meta_type: ClusterMetaType,
        key_prefix: &str,
    ) -> Result<HashMap<String, ClusterMetaEntry>> {
        match self.inner.raft.get_leader_id().await {
            Some(id) if id == self.node_id() => {
                Ok(self.inner.meta_snapshot(meta_type, key_prefix).await)
            }
            Some(leader) => match self.inner.raft.peer_client(leader).await {
                Some(client) => client.fetch_meta(meta_type, key_prefix).await,
                None => Err(NotegridError::NotLeader(Some(leader))),
            },
            None => Err(NotegridError::NotLeader(None)),
        }
    }

    /// Stale local snapshot. Readable even on a minority partition, which
    /// keeps serving last-known process metadata while writes are refused.
    pub async fn get_meta_local(
        &self,
        meta_type: ClusterMetaType,
        key_prefix: &str,
    ) -> HashMap<String, ClusterMetaEntry> {
        self.inner.meta_snapshot(meta_type, key_prefix).await
    }

    /// Replicated write. Routed to the leader and retried up to the
    /// configured attempt count on leadership churn before surfacing.
    pub async fn put_meta(&self, entry: ClusterMetaEntry) -> Result<()> {
        self.write(MetaCommand::PutMeta {
            entry,
            if_absent: false,
        })
        .await
        .map(|_| ())
    }

    /// Register-if-absent. Returns the entry that is in the store after
    /// the write: the caller's own on victory, the pre-existing winner's
    /// otherwise.
    pub async fn put_meta_if_absent(
        &self,
        entry: ClusterMetaEntry,
    ) -> Result<Option<ClusterMetaEntry>> {
        self.write(MetaCommand::PutMeta {
            entry,
            if_absent: true,
        })
        .await
    }

    pub async fn remove_meta(&self, meta_type: ClusterMetaType, key: &str) -> Result<()> {
        self.write(MetaCommand::RemoveMeta {
            meta_type,
            key: key.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn write(&self, command: MetaCommand) -> Result<Option<ClusterMetaEntry>> {
        let attempts = self.inner.config.meta_write_attempts.max(1);
        let mut last_err = NotegridError::NoQuorum("no attempt made".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    self.inner.config.election_timeout_max_ms,
                ))
                .await;
            }
            match self.write_once(command.clone()).await {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(attempt, error = %e, "Metadata write retrying");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        // A member that cannot find or reach any leader after bounded
        // retries is on the losing side of a partition
        match last_err {
            NotegridError::NotLeader(_) => Err(NotegridError::NoQuorum(
                "no leader reachable from this member".to_string(),
            )),
            other => Err(other),
        }
    }

    async fn write_once(&self, command: MetaCommand) -> Result<Option<ClusterMetaEntry>> {
        match self.inner.raft.get_leader_id().await {
            Some(id) if id == self.node_id() => {
                self.inner.leader_write(command).await.into_result()
            }
            Some(leader) => {
                // A configured peer without a client means the link to the
                // leader is severed
                let client = self.inner.raft.peer_client(leader).await.ok_or_else(|| {
                    NotegridError::NoQuorum(format!("leader {} unreachable", leader))
                })?;
                let timeout =
                    Duration::from_millis(self.inner.config.replication_timeout_ms + 2_000);
                client
                    .forward_write(&WriteRequest { command }, timeout)
                    .await
                    .map_err(|e| match e {
                        // An unreachable leader reads as quorum loss from
                        // this side of the partition
                        NotegridError::Http(e) => NotegridError::NoQuorum(e.to_string()),
                        other => other,
                    })?
                    .into_result()
            }
            None => Err(NotegridError::NotLeader(None)),
        }
    }

    /// Fire-and-forget broadcast to every live member's listeners,
    /// including this node's own. At-least-once on the wire; listeners
    /// observe each event once (sequence-number dedup).
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> ClusterEvent {
        let event = self.inner.bus.make_event(topic, payload);
        self.inner.bus.ingest(event.clone());
        if self.inner.broadcast_tx.send(event.clone()).is_err() {
            tracing::warn!("Broadcast loop gone, event delivered locally only");
        }
        event
    }

    pub fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn ClusterEventListener>,
    ) -> Subscription {
        self.inner.bus.subscribe(topic, listener)
    }

    pub async fn status(&self) -> NodeStatus {
        self.inner.status().await
    }

    /// Test-facing partition controls, mirrored from the consensus core.
    pub async fn disconnect_peer(&self, peer_id: u64) {
        self.inner.raft.disconnect_peer(peer_id).await;
    }

    pub async fn reconnect_peer(&self, peer_id: u64) {
        self.inner.raft.reconnect_peer(peer_id).await;
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }
}

impl ClusterInner {
    /// Leader-side write path: append, wait for majority commit, wait for
    /// local apply, then report the applied entry.
    pub async fn leader_write(&self, command: MetaCommand) -> WriteResponse {
        if *self.lifecycle.read().await == Lifecycle::Left {
            return WriteResponse::NoQuorum {
                reason: "node has left the group".to_string(),
            };
        }

        {
            let state = self.raft.state.read().await;
            if state.role != RaftRole::Leader {
                return WriteResponse::NotLeader {
                    leader_hint: state.leader_id,
                };
            }
        }

        // Fast path for registration races: the leader serializes all
        // writes, so its applied store is authoritative enough to answer
        // an if-absent put whose key is already present.
        if let MetaCommand::PutMeta {
            entry,
            if_absent: true,
        } = &command
        {
            if let Some(existing) = self.store.read().await.get(entry.meta_type, &entry.key) {
                return WriteResponse::Applied {
                    entry: Some(existing.clone()),
                };
            }
        }

        let read_back = match &command {
            MetaCommand::PutMeta { entry, .. } => Some((entry.meta_type, entry.key.clone())),
            _ => None,
        };

        let (tx, rx) = oneshot::channel();
        if self
            .raft
            .message_sender()
            .send(RaftMessage::AppendCommand {
                command,
                response_tx: tx,
            })
            .await
            .is_err()
        {
            return WriteResponse::NoQuorum {
                reason: "consensus loop unavailable".to_string(),
            };
        }

        let index = match rx.await {
            Ok(Ok(index)) => index,
            Ok(Err(_)) => {
                let hint = self.raft.get_leader_id().await;
                return WriteResponse::NotLeader { leader_hint: hint };
            }
            Err(_) => {
                return WriteResponse::NoQuorum {
                    reason: "consensus loop dropped the request".to_string(),
                }
            }
        };

        // Majority acknowledgment: the commit index must reach our entry
        let mut commit_rx = self.raft.subscribe_commits();
        let replication_timeout = Duration::from_millis(self.config.replication_timeout_ms);
        let committed = tokio::time::timeout(replication_timeout, async {
            loop {
                if *commit_rx.borrow() >= index {
                    return true;
                }
                if commit_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        if !committed {
            return WriteResponse::NoQuorum {
                reason: format!("entry {} not replicated to a majority in time", index),
            };
        }

        // Local apply is prompt once committed; bounded wait regardless
        let mut applied_rx = self.applied_tx.subscribe();
        let _ = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if *applied_rx.borrow() >= index {
                    return;
                }
                if applied_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        let entry = match read_back {
            Some((meta_type, key)) => self.store.read().await.get(meta_type, &key).cloned(),
            None => None,
        };
        WriteResponse::Applied { entry }
    }

    pub async fn meta_snapshot(
        &self,
        meta_type: ClusterMetaType,
        prefix: &str,
    ) -> HashMap<String, ClusterMetaEntry> {
        self.store.read().await.get_prefixed(meta_type, prefix)
    }

    pub async fn ingest_event(&self, event: ClusterEvent) {
        // Events from the far side of a partition stay there
        if self.raft.is_blocked(event.origin_node).await {
            return;
        }
        self.bus.ingest(event);
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.raft.state.read().await;
        NodeStatus {
            node_id: self.config.node_id,
            role: state.role.to_string(),
            lifecycle: self.lifecycle.read().await.to_string(),
            term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: state.log.len(),
        }
    }
}

/// Applies committed commands to the local store, in log order, on every
/// member. This is the only writer of `MetaStore`.
async fn apply_loop(inner: Arc<ClusterInner>) {
    let mut commit_rx = inner.raft.subscribe_commits();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    break;
                }

                let entries = inner.raft.get_committed_entries().await;
                if entries.is_empty() {
                    continue;
                }

                let mut store = inner.store.write().await;
                let mut applied = 0u64;
                for entry in entries {
                    match entry.command {
                        MetaCommand::PutMeta { entry: meta, if_absent } => {
                            let key = meta.store_key();
                            if store.apply_put(meta, if_absent) {
                                tracing::debug!(key = %key, "Applied metadata put");
                            }
                        }
                        MetaCommand::RemoveMeta { meta_type, key } => {
                            if store.apply_remove(meta_type, &key).is_some() {
                                tracing::debug!(meta_type = %meta_type, key = %key, "Applied metadata remove");
                            }
                        }
                        MetaCommand::Noop => {}
                    }
                    applied = entry.index;
                }
                drop(store);
                if applied > 0 {
                    let _ = inner.applied_tx.send(applied);
                }
            }
        }
    }
}

/// Periodically refreshes this node's `server:{id}` entry so peers see it
/// as live. Failures are expected while partitioned and only traced.
async fn server_heartbeat_loop(inner: Arc<ClusterInner>) {
    let period = (inner.config.heartbeat_cutoff_ms() / 3).max(inner.config.heartbeat_interval_ms);
    let mut interval = tokio::time::interval(Duration::from_millis(period));
    let cluster = Cluster {
        inner: inner.clone(),
    };

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if *inner.lifecycle.read().await != Lifecycle::Serving {
                    continue;
                }
                if inner.raft.get_leader_id().await.is_none() {
                    continue;
                }

                let entry = ClusterMetaEntry::new(
                    ClusterMetaType::ServerMeta,
                    inner.config.node_id.to_string(),
                )
                .with_value("host", inner.config.listen_addr.ip().to_string())
                .with_value("port", inner.config.listen_addr.port());

                if let Err(e) = cluster.put_meta(entry).await {
                    tracing::trace!(error = %e, "Server heartbeat refresh failed");
                }
            }
        }
    }
}

/// Leader-only sweep that drops entries whose heartbeat went stale; a
/// dead node's server entry and its registered processes disappear within
/// a few heartbeat intervals.
async fn eviction_loop(inner: Arc<ClusterInner>) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(inner.config.heartbeat_interval_ms * 2));
    let cutoff = inner.config.heartbeat_cutoff_ms();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if !inner.raft.is_leader().await {
                    continue;
                }

                let stale: Vec<(ClusterMetaType, String)> = {
                    let store = inner.store.read().await;
                    let mut keys = Vec::new();
                    for meta_type in [ClusterMetaType::ServerMeta, ClusterMetaType::ProcessMeta] {
                        for key in store.stale_keys(meta_type, cutoff) {
                            keys.push((meta_type, key));
                        }
                    }
                    keys
                };

                for (meta_type, key) in stale {
                    tracing::info!(meta_type = %meta_type, key = %key, "Evicting stale metadata entry");
                    let response = inner
                        .leader_write(MetaCommand::RemoveMeta {
                            meta_type,
                            key: key.clone(),
                        })
                        .await;
                    if let WriteResponse::NoQuorum { reason } = response {
                        tracing::debug!(key = %key, reason = %reason, "Eviction deferred");
                        break;
                    }
                }
            }
        }
    }
}

/// Delivers published events to peers, one event at a time, preserving
/// per-origin order. Each send gets one redelivery attempt; listener-side
/// dedup absorbs the duplicates.
async fn broadcast_loop(inner: Arc<ClusterInner>, mut rx: mpsc::UnboundedReceiver<ClusterEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let clients = inner.raft.peer_clients().await;
        for client in clients {
            let mut delivered = false;
            for _ in 0..2 {
                match client.send_event(&event).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(
                            peer_id = client.node_id(),
                            topic = %event.topic,
                            error = %e,
                            "Event delivery attempt failed"
                        );
                    }
                }
            }
            if !delivered {
                tracing::warn!(
                    peer_id = client.node_id(),
                    topic = %event.topic,
                    seq = event.seq,
                    "Event not delivered to peer"
                );
            }
        }
    }
}
