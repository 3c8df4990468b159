use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::event::note_event_payload;
use crate::cluster::{Cluster, NOTE_EVENT_TOPIC};
use crate::error::{NotegridError, Result};
use crate::launcher::{LaunchRequest, Launcher};
use crate::process::{ExecuteStatus, ProcessHandle, ProcessRegistry};
use crate::scheduler::job::{Job, JobResult, JobStatus};
use crate::scheduler::note::Note;

/// How a note run behaves: block the caller or return once queued, and
/// share the group's backend or take a dedicated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunMode {
    pub blocking: bool,
    pub isolated: bool,
}

impl RunMode {
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            isolated: false,
        }
    }

    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            isolated: false,
        }
    }

    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }
}

/// Maps a paragraph to the launch request for its backend group. This is
/// the seam to the backend-configuration collaborator; tests plug in a
/// static mapping.
pub trait BackendResolver: Send + Sync {
    fn resolve(&self, note: &Note, job: &Job) -> Result<LaunchRequest>;
}

/// Resolver that binds every paragraph to one fixed group.
pub struct StaticResolver {
    request: LaunchRequest,
}

impl StaticResolver {
    pub fn new(request: LaunchRequest) -> Self {
        Self { request }
    }
}

impl BackendResolver for StaticResolver {
    fn resolve(&self, _note: &Note, _job: &Job) -> Result<LaunchRequest> {
        Ok(self.request.clone())
    }
}

#[derive(Default)]
struct ActiveRunState {
    handle: Option<ProcessHandle>,
    running_job: Option<Uuid>,
}

#[derive(Clone)]
struct ActiveRun {
    token: CancellationToken,
    state: Arc<Mutex<ActiveRunState>>,
}

struct SchedulerInner {
    notes: RwLock<HashMap<String, Note>>,
    registry: Arc<ProcessRegistry>,
    launcher: Arc<Launcher>,
    resolver: Arc<dyn BackendResolver>,
    cluster: Option<Cluster>,
    cancel_grace: Duration,
    active: Mutex<HashMap<String, ActiveRun>>,
}

/// Owns the run state of every note and drives paragraph execution in
/// note order, one Running job at a time per run.
#[derive(Clone)]
pub struct NoteScheduler {
    inner: Arc<SchedulerInner>,
}

impl NoteScheduler {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        launcher: Arc<Launcher>,
        resolver: Arc<dyn BackendResolver>,
        cluster: Option<Cluster>,
        cancel_grace_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                notes: RwLock::new(HashMap::new()),
                registry,
                launcher,
                resolver,
                cluster,
                cancel_grace: Duration::from_millis(cancel_grace_ms),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn add_note(&self, note: Note) {
        self.inner.notes.write().await.insert(note.id.clone(), note);
    }

    pub async fn note(&self, note_id: &str) -> Option<Note> {
        self.inner.notes.read().await.get(note_id).cloned()
    }

    pub async fn remove_note(&self, note_id: &str) -> Result<()> {
        if self.inner.active.lock().await.contains_key(note_id) {
            return Err(NotegridError::Internal(format!(
                "note {} is running",
                note_id
            )));
        }
        self.inner
            .notes
            .write()
            .await
            .remove(note_id)
            .map(|_| ())
            .ok_or_else(|| NotegridError::NoteNotFound(note_id.to_string()))
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatus> {
        let notes = self.inner.notes.read().await;
        for note in notes.values() {
            if let Some(job) = note.job(job_id) {
                return Ok(job.status);
            }
        }
        Err(NotegridError::JobNotFound(job_id))
    }

    /// Run the whole note in order. Blocking mode waits for the terminal
    /// aggregate; non-blocking returns once every job is Pending.
    pub async fn run_note(
        &self,
        note_id: &str,
        params: HashMap<String, String>,
        mode: RunMode,
    ) -> Result<()> {
        let (job_ids, run) = self.queue_jobs(note_id, params, None).await?;
        self.start_run(note_id, job_ids, mode, run).await
    }

    /// Run a single paragraph, blocking until it terminates.
    pub async fn run_paragraph(&self, note_id: &str, job_id: Uuid) -> Result<()> {
        let (job_ids, run) = self.queue_jobs(note_id, HashMap::new(), Some(job_id)).await?;
        self.start_run(note_id, job_ids, RunMode::blocking(), run)
            .await
    }

    /// Queue a single paragraph and return immediately.
    pub async fn submit_paragraph(&self, note_id: &str, job_id: Uuid) -> Result<()> {
        let (job_ids, run) = self.queue_jobs(note_id, HashMap::new(), Some(job_id)).await?;
        self.start_run(note_id, job_ids, RunMode::non_blocking(), run)
            .await
    }

    /// Abort the run: the Running job cooperatively, every Pending job
    /// directly, without dispatch.
    pub async fn cancel_note(&self, note_id: &str) -> Result<()> {
        let run = {
            let active = self.inner.active.lock().await;
            active.get(note_id).cloned()
        };

        {
            let mut notes = self.inner.notes.write().await;
            let note = notes
                .get_mut(note_id)
                .ok_or_else(|| NotegridError::NoteNotFound(note_id.to_string()))?;
            for id in note.job_ids() {
                let job = note.job_mut(id).expect("listed job exists");
                if job.status == JobStatus::Pending {
                    job.set_status(JobStatus::Abort);
                }
            }
        }

        let Some(run) = run else {
            return Ok(());
        };
        run.token.cancel();

        let (handle, running_job) = {
            let state = run.state.lock().await;
            (state.handle.clone(), state.running_job)
        };

        if let (Some(handle), Some(job_id)) = (handle, running_job) {
            let acked = handle.cancel(job_id, self.inner.cancel_grace).await;
            if !acked {
                // The backend would not yield; drop it and move on
                tracing::warn!(note_id, job_id = %job_id, "Cancel not acknowledged, force-closing handle");
                let _ = handle.force_close().await;
            }
            let mut notes = self.inner.notes.write().await;
            if let Some(job) = notes.get_mut(note_id).and_then(|n| n.job_mut(job_id)) {
                job.set_status(JobStatus::Abort);
            }
        }

        tracing::info!(note_id, "Note run cancelled");
        Ok(())
    }

    /// Move the targeted jobs to Pending and register the run, all under
    /// the active-run lock so two callers cannot start the same note.
    /// Restarted terminal jobs are reset first.
    async fn queue_jobs(
        &self,
        note_id: &str,
        params: HashMap<String, String>,
        only_job: Option<Uuid>,
    ) -> Result<(Vec<Uuid>, ActiveRun)> {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(note_id) {
            return Err(NotegridError::Internal(format!(
                "note {} is already running",
                note_id
            )));
        }

        let mut notes = self.inner.notes.write().await;
        let note = notes
            .get_mut(note_id)
            .ok_or_else(|| NotegridError::NoteNotFound(note_id.to_string()))?;
        note.params.extend(params);

        let targets: Vec<Uuid> = match only_job {
            Some(job_id) => {
                note.job(job_id).ok_or(NotegridError::JobNotFound(job_id))?;
                vec![job_id]
            }
            None => note.job_ids(),
        };

        for &id in &targets {
            let job = note.job_mut(id).expect("targeted job exists");
            if job.status.is_terminal() {
                job.status = JobStatus::Ready;
                job.result = None;
                job.completed_at = None;
            }
            job.set_status(JobStatus::Pending);
        }

        let run = ActiveRun {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(ActiveRunState::default())),
        };
        active.insert(note_id.to_string(), run.clone());

        Ok((targets, run))
    }

    async fn start_run(
        &self,
        note_id: &str,
        job_ids: Vec<Uuid>,
        mode: RunMode,
        run: ActiveRun,
    ) -> Result<()> {
        if let Some(cluster) = &self.inner.cluster {
            cluster.publish(
                NOTE_EVENT_TOPIC,
                note_event_payload(note_id, "run_started", cluster.node_id()),
            );
        }

        let scheduler = self.clone();
        let note_id = note_id.to_string();
        if mode.blocking {
            scheduler.drive(&note_id, job_ids, mode, run).await;
            Ok(())
        } else {
            tokio::spawn(async move {
                scheduler.drive(&note_id, job_ids, mode, run).await;
            });
            Ok(())
        }
    }

    /// The run driver: acquire a backend handle, dispatch jobs in order,
    /// stop at the first Error and leave the rest Ready.
    async fn drive(&self, note_id: &str, job_ids: Vec<Uuid>, mode: RunMode, run: ActiveRun) {
        let inner = &self.inner;

        let request = self.resolve_request(note_id, &job_ids).await;
        let handle = match request {
            Ok(request) => {
                let acquired = if mode.isolated {
                    inner.registry.acquire_isolated(&inner.launcher, &request).await
                } else {
                    inner.registry.acquire_shared(&inner.launcher, &request).await
                };
                match acquired {
                    Ok(handle) => handle,
                    Err(e) => {
                        tracing::warn!(note_id, error = %e, "Backend acquisition failed");
                        self.fail_first_pending(note_id, &job_ids, &format!("launch failed: {}", e))
                            .await;
                        self.finish_run(note_id).await;
                        return;
                    }
                }
            }
            Err(e) => {
                self.fail_first_pending(note_id, &job_ids, &format!("no backend resolved: {}", e))
                    .await;
                self.finish_run(note_id).await;
                return;
            }
        };

        run.state.lock().await.handle = Some(handle.clone());

        for &job_id in &job_ids {
            if run.token.is_cancelled() {
                break;
            }

            // Take the job only if it is still queued; cancel may have
            // aborted it in the meantime
            let dispatch = {
                let mut notes = inner.notes.write().await;
                let Some(note) = notes.get_mut(note_id) else { break };
                let context = note.merged_params(job_id);
                match note.job_mut(job_id) {
                    Some(job) if job.status == JobStatus::Pending => {
                        job.set_status(JobStatus::Running);
                        Some((job.code.clone(), context))
                    }
                    _ => None,
                }
            };
            let Some((code, context)) = dispatch else {
                continue;
            };

            run.state.lock().await.running_job = Some(job_id);
            tracing::info!(note_id, job_id = %job_id, "Dispatching paragraph");

            let submitted = handle.submit(job_id, &code, context).await;

            run.state.lock().await.running_job = None;

            let failed = {
                let mut notes = inner.notes.write().await;
                let Some(note) = notes.get_mut(note_id) else { break };
                let Some(job) = note.job_mut(job_id) else { continue };

                match submitted {
                    Ok(resp) if resp.status == ExecuteStatus::Success => {
                        job.finish(JobResult::ok(resp.output));
                        false
                    }
                    Ok(resp) => {
                        let message =
                            resp.message.unwrap_or_else(|| "execution failed".to_string());
                        job.finish(JobResult::error(message));
                        true
                    }
                    Err(e) => {
                        if run.token.is_cancelled() {
                            // Interrupted by cancel; status already Abort
                            // or about to be
                            job.set_status(JobStatus::Abort);
                            false
                        } else {
                            job.finish(JobResult::error(e.to_string()));
                            true
                        }
                    }
                }
            };

            if run.token.is_cancelled() {
                break;
            }
            if failed {
                // Fail fast: downstream code's preconditions are broken,
                // so queued successors go back to Ready untouched
                self.skip_pending(note_id, &job_ids).await;
                break;
            }
        }

        let _ = handle.close().await;
        self.finish_run(note_id).await;
    }

    async fn resolve_request(&self, note_id: &str, job_ids: &[Uuid]) -> Result<LaunchRequest> {
        let notes = self.inner.notes.read().await;
        let note = notes
            .get(note_id)
            .ok_or_else(|| NotegridError::NoteNotFound(note_id.to_string()))?;
        let first = job_ids
            .first()
            .and_then(|&id| note.job(id))
            .ok_or_else(|| NotegridError::Internal("empty run".to_string()))?;
        self.inner.resolver.resolve(note, first)
    }

    /// Launch-failure shape: the first queued job carries the cause as
    /// its Error result, the rest return to Ready with no result.
    async fn fail_first_pending(&self, note_id: &str, job_ids: &[Uuid], message: &str) {
        let mut notes = self.inner.notes.write().await;
        let Some(note) = notes.get_mut(note_id) else { return };
        let mut first = true;
        for &id in job_ids {
            let Some(job) = note.job_mut(id) else { continue };
            if job.status != JobStatus::Pending {
                continue;
            }
            if first {
                job.set_status(JobStatus::Running);
                job.finish(JobResult::error(message));
                first = false;
            } else {
                job.set_status(JobStatus::Ready);
            }
        }
    }

    async fn skip_pending(&self, note_id: &str, job_ids: &[Uuid]) {
        let mut notes = self.inner.notes.write().await;
        let Some(note) = notes.get_mut(note_id) else { return };
        for &id in job_ids {
            if let Some(job) = note.job_mut(id) {
                if job.status == JobStatus::Pending {
                    job.set_status(JobStatus::Ready);
                }
            }
        }
    }

    async fn finish_run(&self, note_id: &str) {
        self.inner.active.lock().await.remove(note_id);
        if let Some(cluster) = &self.inner.cluster {
            cluster.publish(
                NOTE_EVENT_TOPIC,
                note_event_payload(note_id, "run_finished", cluster.node_id()),
            );
        }
    }
}
