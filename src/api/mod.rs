use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::NotegridError;
use crate::scheduler::{Note, NoteScheduler, RunMode};

/// Internal HTTP surface for the CLI and peers' tooling. The end-user
/// REST/WebSocket API lives in a separate service and is not this.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Cluster,
    pub scheduler: NoteScheduler,
}

#[derive(Debug, Deserialize)]
struct CreateNoteRequest {
    id: String,
    name: String,
    #[serde(default)]
    paragraphs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateNoteResponse {
    id: String,
    job_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct RunNoteRequest {
    #[serde(default)]
    blocking: bool,
    #[serde(default)]
    isolated: bool,
    #[serde(default)]
    params: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct JobView {
    id: Uuid,
    index: usize,
    status: String,
    output: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct NoteView {
    id: String,
    name: String,
    running: bool,
    jobs: Vec<JobView>,
}

struct ApiError(NotegridError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NotegridError::NoteNotFound(_) | NotegridError::JobNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            NotegridError::NotLeader(_) | NotegridError::NoQuorum(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<NotegridError> for ApiError {
    fn from(e: NotegridError) -> Self {
        Self(e)
    }
}

pub fn api_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/notes", post(create_note_handler))
        .route("/api/notes/:id", get(get_note_handler))
        .route("/api/notes/:id/run", post(run_note_handler))
        .route("/api/notes/:id/cancel", post(cancel_note_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState) {
    tracing::info!(addr = %addr, "Starting API server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, api_router(state)).await {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn cluster_status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.cluster.status().await)
}

async fn create_note_handler(
    State(state): State<ApiState>,
    Json(req): Json<CreateNoteRequest>,
) -> Json<CreateNoteResponse> {
    let mut note = Note::new(&req.id, &req.name);
    let job_ids = req
        .paragraphs
        .iter()
        .map(|code| note.add_paragraph(code))
        .collect();
    let id = note.id.clone();
    state.scheduler.add_note(note).await;
    Json(CreateNoteResponse { id, job_ids })
}

async fn get_note_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<NoteView>, ApiError> {
    let note = state
        .scheduler
        .note(&id)
        .await
        .ok_or(NotegridError::NoteNotFound(id))?;
    Ok(Json(note_view(&note)))
}

async fn run_note_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RunNoteRequest>,
) -> Result<StatusCode, ApiError> {
    let mode = RunMode {
        blocking: req.blocking,
        isolated: req.isolated,
    };
    state.scheduler.run_note(&id, req.params, mode).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_note_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.cancel_note(&id).await?;
    Ok(StatusCode::OK)
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.scheduler.get_job_status(id).await?;
    Ok(Json(serde_json::json!({ "id": id, "status": status.to_string() })))
}

fn note_view(note: &Note) -> NoteView {
    NoteView {
        id: note.id.clone(),
        name: note.name.clone(),
        running: note.is_running(),
        jobs: note
            .jobs()
            .iter()
            .map(|job| JobView {
                id: job.id,
                index: job.index,
                status: job.status.to_string(),
                output: job.result.as_ref().and_then(|r| r.output.clone()),
                message: job.result.as_ref().and_then(|r| r.message.clone()),
            })
            .collect(),
    }
}
