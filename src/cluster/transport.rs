use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::cluster::membership::ClusterInner;
use crate::cluster::meta::{ClusterMetaEntry, ClusterMetaType};
use crate::cluster::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::cluster::state::MetaCommand;
use crate::cluster::ClusterEvent;
use crate::error::{NotegridError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub command: MetaCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteResponse {
    /// The command was committed and applied; for puts the applied entry
    /// is returned (the pre-existing one when a put-if-absent lost).
    Applied { entry: Option<ClusterMetaEntry> },
    NotLeader { leader_hint: Option<u64> },
    NoQuorum { reason: String },
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MetaQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaResponse {
    pub entries: HashMap<String, ClusterMetaEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: String,
    pub lifecycle: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_len: usize,
}

/// HTTP client for one peer member. Cheap to clone; connection pooling
/// lives inside the shared reqwest client.
#[derive(Clone)]
pub struct PeerClient {
    node_id: u64,
    base_url: String,
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(node_id: u64, addr: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            node_id,
            base_url: format!("http://{}", addr),
            http,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub async fn request_vote(&self, req: &VoteRequest) -> Result<VoteResponse> {
        let resp = self
            .http
            .post(format!("{}/raft/vote", self.base_url))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let resp = self
            .http
            .post(format!("{}/raft/append", self.base_url))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Forward a metadata write to this peer (the presumed leader).
    pub async fn forward_write(&self, req: &WriteRequest, timeout: Duration) -> Result<WriteResponse> {
        let resp = self
            .http
            .post(format!("{}/cluster/write", self.base_url))
            .timeout(timeout)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Strong read: fetch a metadata snapshot from this peer (the leader).
    pub async fn fetch_meta(
        &self,
        meta_type: ClusterMetaType,
        prefix: &str,
    ) -> Result<HashMap<String, ClusterMetaEntry>> {
        let resp = self
            .http
            .get(format!(
                "{}/cluster/meta/{}",
                self.base_url,
                meta_type.key_prefix()
            ))
            .query(&[("prefix", prefix)])
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?;
        let body: MetaResponse = resp.json().await?;
        Ok(body.entries)
    }

    pub async fn send_event(&self, event: &ClusterEvent) -> Result<()> {
        self.http
            .post(format!("{}/cluster/event", self.base_url))
            .timeout(Duration::from_millis(500))
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn fetch_status(&self) -> Result<NodeStatus> {
        let resp = self
            .http
            .get(format!("{}/cluster/status", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Member-facing routes: consensus RPCs, leader-routed writes and reads,
/// event ingestion, status.
pub fn cluster_router(inner: Arc<ClusterInner>) -> Router {
    Router::new()
        .route("/raft/vote", post(vote_handler))
        .route("/raft/append", post(append_handler))
        .route("/cluster/write", post(write_handler))
        .route("/cluster/meta/:meta_type", get(meta_handler))
        .route("/cluster/event", post(event_handler))
        .route("/cluster/status", get(status_handler))
        .with_state(inner)
}

async fn vote_handler(
    State(inner): State<Arc<ClusterInner>>,
    Json(req): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(inner.raft.handle_vote_request(req).await)
}

async fn append_handler(
    State(inner): State<Arc<ClusterInner>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(inner.raft.handle_append_entries_request(req).await)
}

async fn write_handler(
    State(inner): State<Arc<ClusterInner>>,
    Json(req): Json<WriteRequest>,
) -> Json<WriteResponse> {
    Json(inner.leader_write(req.command).await)
}

async fn meta_handler(
    State(inner): State<Arc<ClusterInner>>,
    Path(meta_type): Path<String>,
    Query(query): Query<MetaQuery>,
) -> std::result::Result<Json<MetaResponse>, axum::http::StatusCode> {
    let meta_type = parse_meta_type(&meta_type).ok_or(axum::http::StatusCode::NOT_FOUND)?;
    let entries = inner
        .meta_snapshot(meta_type, query.prefix.as_deref().unwrap_or(""))
        .await;
    Ok(Json(MetaResponse { entries }))
}

async fn event_handler(
    State(inner): State<Arc<ClusterInner>>,
    Json(event): Json<ClusterEvent>,
) -> axum::http::StatusCode {
    inner.ingest_event(event).await;
    axum::http::StatusCode::OK
}

async fn status_handler(State(inner): State<Arc<ClusterInner>>) -> Json<NodeStatus> {
    Json(inner.status().await)
}

pub fn parse_meta_type(s: &str) -> Option<ClusterMetaType> {
    match s {
        "server" => Some(ClusterMetaType::ServerMeta),
        "proc" => Some(ClusterMetaType::ProcessMeta),
        _ => None,
    }
}

impl WriteResponse {
    /// Convert a routed write response into the caller-facing result.
    pub fn into_result(self) -> Result<Option<ClusterMetaEntry>> {
        match self {
            WriteResponse::Applied { entry } => Ok(entry),
            WriteResponse::NotLeader { leader_hint } => Err(NotegridError::NotLeader(leader_hint)),
            WriteResponse::NoQuorum { reason } => Err(NotegridError::NoQuorum(reason)),
        }
    }
}
