use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of fact held in the replicated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterMetaType {
    /// A front-end member node (`server:{nodeId}`)
    ServerMeta,
    /// A running backend process (`proc:{groupId}`)
    ProcessMeta,
}

impl ClusterMetaType {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            ClusterMetaType::ServerMeta => "server",
            ClusterMetaType::ProcessMeta => "proc",
        }
    }
}

impl std::fmt::Display for ClusterMetaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// One fact in the replicated metadata store.
///
/// `version` is assigned at apply time and grows monotonically per key.
/// `last_heartbeat` is carried in the write; entries whose heartbeat goes
/// stale are evicted by the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetaEntry {
    pub meta_type: ClusterMetaType,
    pub key: String,
    pub value: HashMap<String, serde_json::Value>,
    pub version: u64,
    pub last_heartbeat: DateTime<Utc>,
}

impl ClusterMetaEntry {
    pub fn new(meta_type: ClusterMetaType, key: impl Into<String>) -> Self {
        Self {
            meta_type,
            key: key.into(),
            value: HashMap::new(),
            version: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_value(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.value.insert(key.to_string(), value.into());
        self
    }

    /// Full store key, encoded as `{type}:{key}`.
    pub fn store_key(&self) -> String {
        format!("{}:{}", self.meta_type.key_prefix(), self.key)
    }

    pub fn heartbeat_age_ms(&self) -> i64 {
        (Utc::now() - self.last_heartbeat).num_milliseconds()
    }

    /// A heartbeat-fresh entry's owner is presumed alive.
    pub fn is_fresh(&self, cutoff_ms: u64) -> bool {
        let age = self.heartbeat_age_ms();
        age >= 0 && (age as u64) < cutoff_ms
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    pub fn u64_value(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    pub fn bool_value(&self, key: &str) -> Option<bool> {
        self.value.get(key).and_then(|v| v.as_bool())
    }
}

/// The applied state machine behind the Raft log: a versioned key-value
/// map per meta type. Mutated only by applying committed log entries, so
/// every member converges on the same contents.
#[derive(Debug, Default)]
pub struct MetaStore {
    entries: HashMap<ClusterMetaType, HashMap<String, ClusterMetaEntry>>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a put. Returns false (leaving the store untouched) when
    /// `if_absent` is set and the key already exists; the version is
    /// bumped from whatever the store held before.
    pub fn apply_put(&mut self, mut entry: ClusterMetaEntry, if_absent: bool) -> bool {
        let bucket = self.entries.entry(entry.meta_type).or_default();
        match bucket.get(&entry.key) {
            Some(existing) if if_absent => {
                tracing::debug!(key = %existing.store_key(), "put-if-absent lost, entry exists");
                false
            }
            Some(existing) => {
                entry.version = existing.version + 1;
                bucket.insert(entry.key.clone(), entry);
                true
            }
            None => {
                entry.version = 1;
                bucket.insert(entry.key.clone(), entry);
                true
            }
        }
    }

    /// Apply a remove. Returns the removed entry, if any.
    pub fn apply_remove(
        &mut self,
        meta_type: ClusterMetaType,
        key: &str,
    ) -> Option<ClusterMetaEntry> {
        self.entries.get_mut(&meta_type)?.remove(key)
    }

    pub fn get(&self, meta_type: ClusterMetaType, key: &str) -> Option<&ClusterMetaEntry> {
        self.entries.get(&meta_type)?.get(key)
    }

    /// Snapshot of all entries of a type whose key starts with `prefix`.
    pub fn get_prefixed(
        &self,
        meta_type: ClusterMetaType,
        prefix: &str,
    ) -> HashMap<String, ClusterMetaEntry> {
        self.entries
            .get(&meta_type)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of a type whose heartbeat is older than the cutoff.
    pub fn stale_keys(&self, meta_type: ClusterMetaType, cutoff_ms: u64) -> Vec<String> {
        self.entries
            .get(&meta_type)
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|e| !e.is_fresh(cutoff_ms))
                    .map(|e| e.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, meta_type: ClusterMetaType) -> usize {
        self.entries.get(&meta_type).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|b| b.is_empty())
    }
}

/// Builds the ProcessMeta value map for a registered backend process.
pub fn process_meta_value(
    host: &str,
    port: u16,
    connect_timeout_ms: u64,
    impersonated: bool,
) -> HashMap<String, serde_json::Value> {
    let mut value = HashMap::new();
    value.insert("host".to_string(), serde_json::json!(host));
    value.insert("port".to_string(), serde_json::json!(port));
    value.insert(
        "connect_timeout_ms".to_string(),
        serde_json::json!(connect_timeout_ms),
    );
    value.insert("impersonated".to_string(), serde_json::json!(impersonated));
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn proc_entry(key: &str) -> ClusterMetaEntry {
        ClusterMetaEntry::new(ClusterMetaType::ProcessMeta, key)
            .with_value("host", "127.0.0.1")
            .with_value("port", 9400)
    }

    #[test]
    fn store_key_encoding() {
        let entry = proc_entry("spark-shared");
        assert_eq!(entry.store_key(), "proc:spark-shared");

        let server = ClusterMetaEntry::new(ClusterMetaType::ServerMeta, "3");
        assert_eq!(server.store_key(), "server:3");
    }

    #[test]
    fn put_assigns_monotonic_versions() {
        let mut store = MetaStore::new();
        assert!(store.apply_put(proc_entry("g1"), false));
        assert_eq!(store.get(ClusterMetaType::ProcessMeta, "g1").unwrap().version, 1);

        assert!(store.apply_put(proc_entry("g1"), false));
        assert_eq!(store.get(ClusterMetaType::ProcessMeta, "g1").unwrap().version, 2);

        assert!(store.apply_put(proc_entry("g1"), false));
        assert_eq!(store.get(ClusterMetaType::ProcessMeta, "g1").unwrap().version, 3);
    }

    #[test]
    fn put_if_absent_rejects_existing() {
        let mut store = MetaStore::new();
        let first = proc_entry("g1").with_value("port", 9400);
        let second = proc_entry("g1").with_value("port", 9999);

        assert!(store.apply_put(first, true));
        assert!(!store.apply_put(second, true));

        let kept = store.get(ClusterMetaType::ProcessMeta, "g1").unwrap();
        assert_eq!(kept.u64_value("port"), Some(9400));
        assert_eq!(kept.version, 1);
    }

    #[test]
    fn remove_returns_entry() {
        let mut store = MetaStore::new();
        store.apply_put(proc_entry("g1"), false);

        let removed = store.apply_remove(ClusterMetaType::ProcessMeta, "g1");
        assert!(removed.is_some());
        assert!(store.get(ClusterMetaType::ProcessMeta, "g1").is_none());
        assert!(store.apply_remove(ClusterMetaType::ProcessMeta, "g1").is_none());
    }

    #[test]
    fn prefixed_snapshot() {
        let mut store = MetaStore::new();
        store.apply_put(proc_entry("spark-a"), false);
        store.apply_put(proc_entry("spark-b"), false);
        store.apply_put(proc_entry("python-a"), false);

        let snapshot = store.get_prefixed(ClusterMetaType::ProcessMeta, "spark-");
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("spark-a"));
        assert!(snapshot.contains_key("spark-b"));

        let all = store.get_prefixed(ClusterMetaType::ProcessMeta, "");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn stale_detection() {
        let mut store = MetaStore::new();
        let mut old = proc_entry("dead");
        old.last_heartbeat = Utc::now() - Duration::milliseconds(10_000);
        store.apply_put(old, false);
        store.apply_put(proc_entry("alive"), false);

        let stale = store.stale_keys(ClusterMetaType::ProcessMeta, 1_000);
        assert_eq!(stale, vec!["dead".to_string()]);
    }

    #[test]
    fn process_meta_value_fields() {
        let value = process_meta_value("10.0.0.5", 9400, 5000, true);
        assert_eq!(value["host"], serde_json::json!("10.0.0.5"));
        assert_eq!(value["port"], serde_json::json!(9400));
        assert_eq!(value["connect_timeout_ms"], serde_json::json!(5000));
        assert_eq!(value["impersonated"], serde_json::json!(true));
    }
}
