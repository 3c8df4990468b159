use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};

/// An ordered container of paragraphs. Insertion order is execution
/// order; there is no branching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub name: String,
    jobs: Vec<Job>,
    /// Note-level parameters applied to every paragraph
    pub params: HashMap<String, String>,
}

impl Note {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            jobs: Vec::new(),
            params: HashMap::new(),
        }
    }

    /// Append a paragraph; returns its job id
    pub fn add_paragraph(&mut self, code: &str) -> Uuid {
        let job = Job::new(&self.id, self.jobs.len(), code);
        let id = job.id;
        self.jobs.push(job);
        id
    }

    pub fn remove_paragraph(&mut self, job_id: Uuid) -> Option<Job> {
        let pos = self.jobs.iter().position(|j| j.id == job_id)?;
        let job = self.jobs.remove(pos);
        for (index, job) in self.jobs.iter_mut().enumerate() {
            job.index = index;
        }
        Some(job)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, job_id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    /// True iff at least one contained job is Pending or Running
    pub fn is_running(&self) -> bool {
        self.jobs.iter().any(|j| j.status.is_active())
    }

    /// Parameters a paragraph's submit carries: job defaults, overlaid by
    /// note params, overlaid by paragraph params.
    pub fn merged_params(&self, job_id: Uuid) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        if let Some(job) = self.job(job_id) {
            merged.extend(job.defaults.clone());
            merged.extend(self.params.clone());
            merged.extend(job.params.clone());
        } else {
            merged.extend(self.params.clone());
        }
        merged
    }
}
