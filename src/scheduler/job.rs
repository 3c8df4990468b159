use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run state of one paragraph.
///
/// Ready → Pending → Running → {Finished, Error, Abort}; the three
/// terminal states are never left. A job skipped by fail-fast returns to
/// Ready, which is a legal Pending → Ready reset (it never ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Ready,
    Pending,
    Running,
    Finished,
    Error,
    Abort,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error | JobStatus::Abort)
    }

    /// Pending or Running: the job keeps its note's running flag up
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ready => write!(f, "ready"),
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub output: Option<String>,
    pub message: Option<String>,
}

impl JobResult {
    pub fn ok(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            message: Some(message.into()),
        }
    }
}

/// One paragraph: a unit of schedulable work inside a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub note_id: String,
    /// Position inside the note; insertion order is execution order
    pub index: usize,
    pub code: String,
    pub config: HashMap<String, serde_json::Value>,
    /// Paragraph-level parameters; override note-level on submit
    pub params: HashMap<String, String>,
    /// Job-declared fallbacks for parameters absent at both levels
    pub defaults: HashMap<String, String>,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(note_id: &str, index: usize, code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            note_id: note_id.to_string(),
            index,
            code: code.to_string(),
            config: HashMap::new(),
            params: HashMap::new(),
            defaults: HashMap::new(),
            status: JobStatus::Ready,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Transition guard: terminal states are final; everything else is
    /// the scheduler's business. Returns false when the transition is
    /// refused.
    pub fn set_status(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn finish(&mut self, result: JobResult) -> bool {
        let status = if result.success {
            JobStatus::Finished
        } else {
            JobStatus::Error
        };
        if self.set_status(status) {
            self.result = Some(result);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_ready() {
        let job = Job::new("note1", 0, "print(1)");
        assert_eq!(job.status, JobStatus::Ready);
        assert!(job.result.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = Job::new("note1", 0, "x");
        assert!(job.set_status(JobStatus::Pending));
        assert!(job.set_status(JobStatus::Running));
        assert!(job.finish(JobResult::error("boom")));
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.completed_at.is_some());

        // Late transitions bounce off
        assert!(!job.set_status(JobStatus::Abort));
        assert!(!job.finish(JobResult::ok(None)));
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn finish_maps_success_flag_to_status() {
        let mut ok = Job::new("n", 0, "x");
        ok.set_status(JobStatus::Running);
        ok.finish(JobResult::ok(Some("42".to_string())));
        assert_eq!(ok.status, JobStatus::Finished);
        assert_eq!(ok.result.as_ref().unwrap().output.as_deref(), Some("42"));

        let mut bad = Job::new("n", 1, "y");
        bad.set_status(JobStatus::Running);
        bad.finish(JobResult::error("nope"));
        assert_eq!(bad.status, JobStatus::Error);
    }

    #[test]
    fn status_classification() {
        assert!(!JobStatus::Ready.is_active());
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Abort.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
    }
}
