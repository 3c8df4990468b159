use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cluster::{Cluster, ClusterMetaEntry, ClusterMetaType};
use crate::error::Result;
use crate::launcher::{LaunchRequest, Launcher};
use crate::process::ProcessHandle;

/// Cluster-aware launch strategy: reuse a live process registered by any
/// member before spawning a new one.
///
/// The replicated store is the single source of truth for who owns which
/// process; it is consulted on every launch, never trusted from a cache.
/// Registration uses put-if-absent, so two members racing to launch the
/// same group converge on one Owned process — the loser tears its spawn
/// down and connects to the winner's endpoint.
pub struct ClusterLauncher {
    cluster: Cluster,
    inner: Launcher,
    group_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

enum Lookup {
    Live(ProcessHandle),
    Stale,
    Absent,
}

impl ClusterLauncher {
    pub fn new(cluster: Cluster, inner: Launcher) -> Self {
        Self {
            cluster,
            inner,
            group_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle> {
        // Serialize launches per group on this node; the store's
        // put-if-absent covers races across nodes.
        let lock = {
            let mut locks = self.group_locks.lock().await;
            locks
                .entry(request.group_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        match self.find_live(request).await {
            Lookup::Live(handle) => return Ok(handle),
            Lookup::Stale => {
                // Drop the dead registration so our put-if-absent below
                // does not lose to it
                if let Err(e) = self
                    .cluster
                    .remove_meta(ClusterMetaType::ProcessMeta, &request.group_id)
                    .await
                {
                    tracing::debug!(group_id = %request.group_id, error = %e, "Stale entry removal failed");
                }
            }
            Lookup::Absent => {}
        }

        // Nothing live: delegate to the configured strategy
        let spawned = Box::pin(self.inner.launch(request)).await?;

        let entry = process_entry(request, spawned.host(), spawned.port());
        match self.cluster.put_meta_if_absent(entry).await {
            Ok(Some(applied)) => {
                let winner_host = applied.str_value("host").unwrap_or_default().to_string();
                let winner_port = applied.u64_value("port").unwrap_or_default() as u16;
                if winner_host == spawned.host() && winner_port == spawned.port() {
                    tracing::info!(
                        group_id = %request.group_id,
                        endpoint = %format!("{}:{}", winner_host, winner_port),
                        "Registered new backend process"
                    );
                    Ok(spawned)
                } else {
                    // Another member won the registration race
                    tracing::info!(
                        group_id = %request.group_id,
                        winner = %format!("{}:{}", winner_host, winner_port),
                        "Lost registration race, reusing winner's process"
                    );
                    let _ = spawned.force_close().await;
                    Ok(self.discovered_from(&applied, request))
                }
            }
            Ok(None) => Ok(spawned),
            Err(e) => {
                // Unregistered processes are invisible to the cluster and
                // would leak; fail the launch instead.
                tracing::warn!(group_id = %request.group_id, error = %e, "Process registration failed");
                let _ = spawned.force_close().await;
                Err(e)
            }
        }
    }

    /// Look the group up in the replicated store and build a Discovered
    /// handle when a fresh-heartbeat entry exists.
    async fn find_live(&self, request: &LaunchRequest) -> Lookup {
        let entries = match self
            .cluster
            .get_meta(ClusterMetaType::ProcessMeta, &request.group_id)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                // Leaderless moments fall back to the local snapshot;
                // stale entries are filtered by the freshness check below.
                tracing::debug!(group_id = %request.group_id, error = %e, "Strong meta read failed, using local snapshot");
                self.cluster
                    .get_meta_local(ClusterMetaType::ProcessMeta, &request.group_id)
                    .await
            }
        };

        let Some(entry) = entries.get(&request.group_id) else {
            return Lookup::Absent;
        };
        if !entry.is_fresh(self.cluster.config().heartbeat_cutoff_ms()) {
            tracing::info!(
                group_id = %request.group_id,
                age_ms = entry.heartbeat_age_ms(),
                "Registered process heartbeat is stale, launching fresh"
            );
            return Lookup::Stale;
        }

        tracing::info!(
            group_id = %request.group_id,
            host = entry.str_value("host").unwrap_or_default(),
            "Reusing live backend process from cluster metadata"
        );
        Lookup::Live(self.discovered_from(entry, request))
    }

    fn discovered_from(&self, entry: &ClusterMetaEntry, request: &LaunchRequest) -> ProcessHandle {
        let host = entry.str_value("host").unwrap_or("127.0.0.1").to_string();
        let port = entry.u64_value("port").unwrap_or_default() as u16;
        let connect_timeout = entry
            .u64_value("connect_timeout_ms")
            .unwrap_or(request.connect_timeout_ms);
        let impersonated = entry.bool_value("impersonated").unwrap_or(false);
        ProcessHandle::discovered(
            &request.group_id,
            &host,
            port,
            connect_timeout,
            impersonated,
            Some(self.cluster.clone()),
        )
    }
}

fn process_entry(request: &LaunchRequest, host: &str, port: u16) -> ClusterMetaEntry {
    let mut entry = ClusterMetaEntry::new(ClusterMetaType::ProcessMeta, &request.group_id);
    entry.value = crate::cluster::meta::process_meta_value(
        host,
        port,
        request.connect_timeout_ms,
        request.impersonated,
    );
    entry
}
