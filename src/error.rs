use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotegridError {
    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Launch timed out after {0} ms")]
    LaunchTimeout(u64),

    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("No quorum: {0}")]
    NoQuorum(String),

    #[error("Cluster bootstrap timed out after {0} ms")]
    ClusterBootstrapTimeout(u64),

    #[error("Note not found: {0}")]
    NoteNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("No backend process registered for group: {0}")]
    ProcessNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotegridError {
    /// True for errors the caller may retry with backoff (timeouts and
    /// quorum/leadership churn), false for errors that need operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotegridError::LaunchTimeout(_)
                | NotegridError::ConnectTimeout(_)
                | NotegridError::NotLeader(_)
                | NotegridError::NoQuorum(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NotegridError>;
