pub mod client;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::{Cluster, ClusterMetaEntry, ClusterMetaType};
use crate::error::{NotegridError, Result};

pub use client::{BackendClient, ExecuteRequest, ExecuteResponse, ExecuteStatus};
pub use registry::ProcessRegistry;

/// Whether this node is responsible for the backend process's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// This node spawned and supervises the OS process
    Owned,
    /// Another member owns it; we only hold a network handle
    Discovered,
}

/// What an Owned handle must tear down when the last session closes.
#[derive(Debug)]
pub enum Supervisor {
    Child(tokio::process::Child),
    Container { id: String },
    Application { id: String, manager_endpoint: String },
}

#[derive(Debug)]
struct HandleState {
    connected: bool,
    refs: usize,
    closed: bool,
    last_used: Instant,
}

struct HandleInner {
    group_id: String,
    setting_name: String,
    host: String,
    port: u16,
    kind: HandleKind,
    connect_timeout_ms: u64,
    impersonated: bool,
    client: BackendClient,
    /// Connection/refcount state; every mutation goes through this lock
    state: Mutex<HandleState>,
    supervisor: Mutex<Option<Supervisor>>,
    hb_cancel: CancellationToken,
    cluster: Option<Cluster>,
}

/// A reference-counted handle to one backend process endpoint.
///
/// Clones share the underlying state; `acquire` binds a new session and
/// `close` unbinds one. The OS process dies when the last session of an
/// Owned handle closes — a Discovered handle's close only drops the
/// reference.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn owned(
        group_id: &str,
        setting_name: &str,
        host: &str,
        port: u16,
        connect_timeout_ms: u64,
        impersonated: bool,
        supervisor: Supervisor,
        cluster: Option<Cluster>,
    ) -> Self {
        Self::new(
            group_id,
            setting_name,
            host,
            port,
            connect_timeout_ms,
            impersonated,
            HandleKind::Owned,
            Some(supervisor),
            cluster,
        )
    }

    pub fn discovered(
        group_id: &str,
        host: &str,
        port: u16,
        connect_timeout_ms: u64,
        impersonated: bool,
        cluster: Option<Cluster>,
    ) -> Self {
        Self::new(
            group_id,
            "",
            host,
            port,
            connect_timeout_ms,
            impersonated,
            HandleKind::Discovered,
            None,
            cluster,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        group_id: &str,
        setting_name: &str,
        host: &str,
        port: u16,
        connect_timeout_ms: u64,
        impersonated: bool,
        kind: HandleKind,
        supervisor: Option<Supervisor>,
        cluster: Option<Cluster>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                group_id: group_id.to_string(),
                setting_name: setting_name.to_string(),
                host: host.to_string(),
                port,
                kind,
                connect_timeout_ms,
                impersonated,
                client: BackendClient::new(host, port),
                state: Mutex::new(HandleState {
                    connected: false,
                    refs: 1,
                    closed: false,
                    last_used: Instant::now(),
                }),
                supervisor: Mutex::new(supervisor),
                hb_cancel: CancellationToken::new(),
                cluster,
            }),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    pub fn is_owned(&self) -> bool {
        self.inner.kind == HandleKind::Owned
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn setting_name(&self) -> &str {
        &self.inner.setting_name
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn impersonated(&self) -> bool {
        self.inner.impersonated
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.inner.connect_timeout_ms
    }

    /// Bind another session to this process
    pub async fn acquire(&self) -> ProcessHandle {
        let mut state = self.inner.state.lock().await;
        state.refs += 1;
        state.last_used = Instant::now();
        self.clone()
    }

    pub async fn refs(&self) -> usize {
        self.inner.state.lock().await.refs
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.state.lock().await.last_used.elapsed()
    }

    /// Establish the channel to the backend: ping with bounded backoff
    /// until the connect timeout. A successful connect refreshes the
    /// process metadata heartbeat so peers observe liveness.
    pub async fn connect(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(NotegridError::BackendUnreachable(
                    "handle is closed".to_string(),
                ));
            }
            if state.connected {
                return Ok(());
            }
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.inner.connect_timeout_ms.max(1));
        let mut backoff = Duration::from_millis(50);

        loop {
            match self.inner.client.ping().await {
                Ok(()) => break,
                Err(e) => {
                    if Instant::now() + backoff >= deadline {
                        tracing::warn!(
                            group_id = %self.inner.group_id,
                            endpoint = %format!("{}:{}", self.inner.host, self.inner.port),
                            error = %e,
                            "Backend did not become reachable in time"
                        );
                        return Err(NotegridError::ConnectTimeout(self.inner.connect_timeout_ms));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        state.connected = true;
        state.last_used = Instant::now();
        drop(state);

        tracing::info!(
            group_id = %self.inner.group_id,
            host = %self.inner.host,
            port = self.inner.port,
            "Connected to backend process"
        );

        self.refresh_meta().await;
        if self.is_owned() {
            self.spawn_heartbeat();
        }
        Ok(())
    }

    /// Submit code for execution. Blocks until the backend answers; a
    /// broken channel surfaces as `BackendUnreachable` and is not retried
    /// here — retry policy belongs to the scheduler.
    pub async fn submit(
        &self,
        job_id: Uuid,
        code: &str,
        context: HashMap<String, String>,
    ) -> Result<ExecuteResponse> {
        self.connect().await?;

        let req = ExecuteRequest {
            job_id,
            code: code.to_string(),
            context,
        };
        let result = self.inner.client.execute(&req).await;

        let mut state = self.inner.state.lock().await;
        state.last_used = Instant::now();
        if result.is_err() {
            state.connected = false;
        }
        drop(state);

        result
    }

    /// Cooperative interrupt. Returns true when the backend acknowledged
    /// within the grace period.
    pub async fn cancel(&self, job_id: Uuid, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.inner.client.cancel(job_id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Backend rejected cancel");
                false
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Backend did not acknowledge cancel in time");
                false
            }
        }
    }

    /// Unbind one session. Tears the process down when this was the last
    /// reference and the handle is Owned; a Discovered handle only drops
    /// the reference.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 {
            return Ok(());
        }
        state.closed = true;
        state.connected = false;
        drop(state);

        self.teardown().await
    }

    /// Unconditional teardown, used after a cancel grace period expires.
    pub async fn force_close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.refs = 0;
        state.closed = true;
        state.connected = false;
        drop(state);

        self.teardown().await
    }

    async fn teardown(&self) -> Result<()> {
        self.inner.hb_cancel.cancel();

        if self.inner.kind == HandleKind::Discovered {
            tracing::debug!(group_id = %self.inner.group_id, "Discovered handle released");
            return Ok(());
        }

        // Taking the supervisor guarantees the process dies exactly once
        // even when close and force_close race.
        let supervisor = self.inner.supervisor.lock().await.take();
        match supervisor {
            Some(Supervisor::Child(mut child)) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(group_id = %self.inner.group_id, error = %e, "Failed to kill backend child");
                }
            }
            Some(Supervisor::Container { id }) => {
                let output = tokio::process::Command::new("docker")
                    .args(["rm", "-f", &id])
                    .output()
                    .await;
                if let Err(e) = output {
                    tracing::warn!(container = %id, error = %e, "Failed to remove backend container");
                }
            }
            Some(Supervisor::Application {
                id,
                manager_endpoint,
            }) => {
                let result = reqwest::Client::new()
                    .delete(format!("{}/v1/applications/{}", manager_endpoint, id))
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::warn!(application = %id, error = %e, "Failed to stop backend application");
                }
            }
            None => {}
        }

        if let Some(cluster) = &self.inner.cluster {
            if let Err(e) = cluster
                .remove_meta(ClusterMetaType::ProcessMeta, &self.inner.group_id)
                .await
            {
                tracing::debug!(group_id = %self.inner.group_id, error = %e, "Process deregistration failed");
            }
        }

        tracing::info!(group_id = %self.inner.group_id, "Backend process torn down");
        Ok(())
    }

    fn meta_entry(&self) -> ClusterMetaEntry {
        let mut entry = ClusterMetaEntry::new(ClusterMetaType::ProcessMeta, &self.inner.group_id);
        entry.value = crate::cluster::meta::process_meta_value(
            &self.inner.host,
            self.inner.port,
            self.inner.connect_timeout_ms,
            self.inner.impersonated,
        );
        entry
    }

    async fn refresh_meta(&self) {
        if let Some(cluster) = &self.inner.cluster {
            if let Err(e) = cluster.put_meta(self.meta_entry()).await {
                tracing::debug!(group_id = %self.inner.group_id, error = %e, "Process heartbeat refresh failed");
            }
        }
    }

    /// Background refresh of the process metadata heartbeat for Owned
    /// handles, until the handle closes.
    fn spawn_heartbeat(&self) {
        let Some(cluster) = self.inner.cluster.clone() else {
            return;
        };
        if self.inner.hb_cancel.is_cancelled() {
            return;
        }

        let handle = self.clone();
        let cancel = self.inner.hb_cancel.clone();
        let period = (cluster.config().heartbeat_cutoff_ms() / 3)
            .max(cluster.config().heartbeat_interval_ms);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(period));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        handle.refresh_meta().await;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("group_id", &self.inner.group_id)
            .field("kind", &self.inner.kind)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .finish()
    }
}
