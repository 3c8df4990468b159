use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::launcher::{LaunchRequest, Launcher};
use crate::process::ProcessHandle;

/// Per-node pool of shared backend handles, one per group.
///
/// The registry itself holds one reference on each pooled handle so the
/// process survives between sessions; the idle sweep drops that reference
/// once the handle has been unused for the configured lifetime. Isolated
/// acquisitions bypass the pool entirely.
pub struct ProcessRegistry {
    shared: Mutex<HashMap<String, ProcessHandle>>,
    group_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    idle_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new(idle_timeout_ms: u64) -> Self {
        Self {
            shared: Mutex::new(HashMap::new()),
            group_locks: Mutex::new(HashMap::new()),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
        }
    }

    async fn group_lock(&self, group_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.group_locks.lock().await;
        locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Bind a session to the group's shared handle, launching the backend
    /// if the pool has none (or only a closed one). Launching is
    /// serialized per group so concurrent acquisitions cannot double-spawn.
    pub async fn acquire_shared(
        &self,
        launcher: &Launcher,
        request: &LaunchRequest,
    ) -> Result<ProcessHandle> {
        let lock = self.group_lock(&request.group_id).await;
        let _guard = lock.lock().await;

        {
            let shared = self.shared.lock().await;
            if let Some(handle) = shared.get(&request.group_id) {
                if !handle.is_closed().await {
                    return Ok(handle.acquire().await);
                }
            }
        }

        let handle = launcher.launch(request).await?;
        let session_handle = handle.acquire().await;
        self.shared
            .lock()
            .await
            .insert(request.group_id.clone(), handle);
        Ok(session_handle)
    }

    /// Launch a dedicated backend for one run. The handle never joins the
    /// pool, so concurrent notes sharing the group are untouched.
    pub async fn acquire_isolated(
        &self,
        launcher: &Launcher,
        request: &LaunchRequest,
    ) -> Result<ProcessHandle> {
        launcher.launch(request).await
    }

    /// Number of live pooled handles for a group (0 or 1)
    pub async fn shared_count(&self, group_id: &str) -> usize {
        let shared = self.shared.lock().await;
        match shared.get(group_id) {
            Some(handle) if !handle.is_closed().await => 1,
            _ => 0,
        }
    }

    /// Drop pooled handles whose only remaining reference is the
    /// registry's and whose idle lifetime expired, and forget handles
    /// closed elsewhere.
    pub async fn evict_idle(&self) {
        let mut shared = self.shared.lock().await;
        let mut evict = Vec::new();
        for (group_id, handle) in shared.iter() {
            if handle.is_closed().await {
                evict.push((group_id.clone(), None));
            } else if handle.refs().await == 1 && handle.idle_for().await >= self.idle_timeout {
                evict.push((group_id.clone(), Some(handle.clone())));
            }
        }

        for (group_id, handle) in evict {
            shared.remove(&group_id);
            if let Some(handle) = handle {
                tracing::info!(group_id = %group_id, "Evicting idle backend handle");
                if let Err(e) = handle.close().await {
                    tracing::warn!(group_id = %group_id, error = %e, "Idle eviction close failed");
                }
            }
        }
    }

    /// Periodic idle sweep until cancelled
    pub fn spawn_idle_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let period = (self.idle_timeout / 4).max(Duration::from_millis(250));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => self.evict_idle().await,
                }
            }
        });
    }

    /// Close every pooled handle (node shutdown)
    pub async fn close_all(&self) {
        let mut shared = self.shared.lock().await;
        for (group_id, handle) in shared.drain() {
            if let Err(e) = handle.close().await {
                tracing::warn!(group_id = %group_id, error = %e, "Shutdown close failed");
            }
        }
    }
}
