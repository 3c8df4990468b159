//! Launch strategy tests: local spawn validation, cluster-aware process
//! reuse, duplicate-spawn prevention, and pool semantics.

mod test_harness;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notegrid::cluster::{ClusterMetaEntry, ClusterMetaType};
use notegrid::config::{LaunchMode, LauncherConfig};
use notegrid::launcher::{LaunchRequest, Launcher};
use notegrid::process::{HandleKind, ProcessRegistry};
use test_harness::TestCluster;

/// Local-mode launcher config rooted in a tempdir with a real runner
/// binary (`/bin/sh` exits immediately; these tests only exercise
/// metadata and lifecycle, not execution).
fn local_config(working_root: &std::path::Path) -> LauncherConfig {
    LauncherConfig {
        mode: LaunchMode::Local,
        runner_path: PathBuf::from("/bin/sh"),
        working_root: working_root.to_path_buf(),
        ..Default::default()
    }
}

fn fresh_proc_entry(group: &str, port: u16) -> ClusterMetaEntry {
    ClusterMetaEntry::new(ClusterMetaType::ProcessMeta, group)
        .with_value("host", "127.0.0.1")
        .with_value("port", port)
        .with_value("connect_timeout_ms", 5_000)
        .with_value("impersonated", false)
}

#[tokio::test]
async fn cluster_aware_reuses_live_registered_process() {
    let mut cluster = TestCluster::new(1, 9800).await;
    let member = cluster.get_node(1).unwrap().cluster.clone();

    // A process some other front-end registered moments ago
    member
        .put_meta(fresh_proc_entry("spark-live", 4242))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("spark")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), Some(member));

    let handle = launcher
        .launch(&LaunchRequest::new("spark-live", "spark"))
        .await
        .expect("lookup should yield a handle without spawning");

    assert_eq!(handle.kind(), HandleKind::Discovered);
    assert_eq!(handle.host(), "127.0.0.1");
    assert_eq!(handle.port(), 4242);
    assert_eq!(handle.connect_timeout_ms(), 5_000);

    handle.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn cluster_aware_replaces_stale_registration() {
    let mut cluster = TestCluster::new(1, 9810).await;
    let member = cluster.get_node(1).unwrap().cluster.clone();

    let mut dead = fresh_proc_entry("spark-stale", 4242);
    dead.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(30);
    member.put_meta(dead).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("spark")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), Some(member.clone()));

    let handle = launcher
        .launch(&LaunchRequest::new("spark-stale", "spark"))
        .await
        .expect("stale entry should not block a fresh launch");

    assert_eq!(handle.kind(), HandleKind::Owned);
    assert_ne!(handle.port(), 4242, "a new process was spawned");

    // The store now points at the new endpoint
    let entries = member
        .get_meta(ClusterMetaType::ProcessMeta, "spark-stale")
        .await
        .unwrap();
    assert_eq!(
        entries["spark-stale"].u64_value("port"),
        Some(handle.port() as u64)
    );

    handle.close().await.unwrap();
    cluster.shutdown().await;
}

/// Concurrent launches for one group yield exactly one
/// Owned process; everyone else discovers it.
#[tokio::test]
async fn concurrent_launches_spawn_exactly_once() {
    let mut cluster = TestCluster::new(1, 9820).await;
    let member = cluster.get_node(1).unwrap().cluster.clone();

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("python")).unwrap();
    let launcher = Arc::new(Launcher::from_config(
        &local_config(dir.path()),
        Some(member),
    ));

    let mut joins = Vec::new();
    for _ in 0..4 {
        let launcher = launcher.clone();
        joins.push(tokio::spawn(async move {
            launcher
                .launch(&LaunchRequest::new("python-g1", "python"))
                .await
        }));
    }

    let mut handles = Vec::new();
    for join in joins {
        handles.push(join.await.unwrap().expect("launch should succeed"));
    }

    let owned: Vec<_> = handles.iter().filter(|h| h.is_owned()).collect();
    let discovered: Vec<_> = handles
        .iter()
        .filter(|h| h.kind() == HandleKind::Discovered)
        .collect();
    assert_eq!(owned.len(), 1, "exactly one Owned process");
    assert_eq!(discovered.len(), 3, "the rest discover it");

    let endpoint = (owned[0].host().to_string(), owned[0].port());
    for handle in &discovered {
        assert_eq!((handle.host().to_string(), handle.port()), endpoint);
    }

    for handle in &handles {
        let _ = handle.close().await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn shared_pool_reuses_one_process_per_group() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shell")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), None);
    let registry = ProcessRegistry::new(60_000);
    let request = LaunchRequest::new("shell-g1", "shell");

    let first = registry.acquire_shared(&launcher, &request).await.unwrap();
    let second = registry.acquire_shared(&launcher, &request).await.unwrap();

    assert_eq!(first.port(), second.port(), "same underlying process");
    assert_eq!(registry.shared_count("shell-g1").await, 1);
    // Registry ref + two sessions
    assert_eq!(first.refs().await, 3);

    first.close().await.unwrap();
    second.close().await.unwrap();
    assert!(!first.is_closed().await, "registry still holds its ref");
    assert_eq!(registry.shared_count("shell-g1").await, 1);

    registry.close_all().await;
}

/// An isolated run never grows the shared pool.
#[tokio::test]
async fn isolated_acquisition_bypasses_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shell")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), None);
    let registry = ProcessRegistry::new(60_000);
    let request = LaunchRequest::new("shell-g2", "shell");

    let isolated = registry.acquire_isolated(&launcher, &request).await.unwrap();
    assert_eq!(registry.shared_count("shell-g2").await, 0);

    let shared = registry.acquire_shared(&launcher, &request).await.unwrap();
    assert_eq!(registry.shared_count("shell-g2").await, 1);

    let isolated_two = registry.acquire_isolated(&launcher, &request).await.unwrap();
    assert_eq!(
        registry.shared_count("shell-g2").await,
        1,
        "isolated acquisition must not touch the pool"
    );
    assert_ne!(isolated_two.port(), shared.port());

    // Isolated handles tear down on close (single reference)
    isolated.close().await.unwrap();
    assert!(isolated.is_closed().await);

    isolated_two.close().await.unwrap();
    shared.close().await.unwrap();
    registry.close_all().await;
}

/// Closing all sessions terminates the process exactly
/// once, regardless of close ordering.
#[tokio::test]
async fn refcounted_close_tears_down_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shell")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), None);

    let handle = launcher
        .launch(&LaunchRequest::new("shell-g3", "shell"))
        .await
        .unwrap();
    assert_eq!(handle.refs().await, 1);

    let session_a = handle.acquire().await;
    let session_b = handle.acquire().await;
    assert_eq!(handle.refs().await, 3);

    session_b.close().await.unwrap();
    assert!(!handle.is_closed().await);
    handle.close().await.unwrap();
    assert!(!handle.is_closed().await);
    session_a.close().await.unwrap();
    assert!(handle.is_closed().await, "last close tears down");

    // Idempotent afterwards
    session_a.close().await.unwrap();
    assert_eq!(handle.refs().await, 0);
}

#[tokio::test]
async fn idle_pool_entries_are_evicted() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shell")).unwrap();
    let launcher = Launcher::from_config(&local_config(dir.path()), None);
    let registry = ProcessRegistry::new(100);
    let request = LaunchRequest::new("shell-g4", "shell");

    let session = registry.acquire_shared(&launcher, &request).await.unwrap();
    session.close().await.unwrap();
    assert_eq!(registry.shared_count("shell-g4").await, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    registry.evict_idle().await;

    assert_eq!(
        registry.shared_count("shell-g4").await,
        0,
        "idle unreferenced handle should be gone"
    );
    assert!(session.is_closed().await);
}
