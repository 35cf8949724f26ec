//! Error types for the 3scale Operator

use std::time::Duration;

use kube::runtime::finalizer::Error as FinalizerError;
use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Admin API returned an unexpected status
    #[error("Admin API error (status {status}): {message}")]
    Remote { status: u16, message: String },

    /// Admin API object does not exist
    #[error("Admin API object not found: {0}")]
    RemoteNotFound(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote state inconsistent with what was just applied
    #[error("Sync error: {0}")]
    Sync(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Spec can never be synchronized as written
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Spec references an object that does not exist yet
    #[error("Orphan spec: {0}")]
    OrphanSpec(String),

    /// A dependency is still converging
    #[error("Not ready: {message}")]
    NotReady { message: String, retry_after: Duration },

    /// Sync task failed
    #[error("Task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<Error>,
    },

    /// Pipeline step registered twice
    #[error("Duplicate pipeline step: {0}")]
    DuplicateStep(String),

    /// Optimistic concurrency conflict on write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// Job failed
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Synchronization failed with an already classified outcome
    #[error("Synchronization failed: {0}")]
    Unsynced(SyncError),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<FinalizerError<Error>>),
}

/// Outcome of a failed synchronization, decided once per reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// Spec is wrong; retrying without a spec change cannot help
    Invalid(String),
    /// Spec references something that does not exist yet
    Orphan(String),
    /// Anything else; retried with backoff
    Transient(String),
    /// Waiting on a dependency; retried after a fixed delay
    Wait { message: String, retry_after: Duration },
}

impl SyncError {
    pub fn message(&self) -> &str {
        match self {
            SyncError::Invalid(m) | SyncError::Orphan(m) | SyncError::Transient(m) => m,
            SyncError::Wait { message, .. } => message,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid spec error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidSpec(msg.into())
    }

    /// Create an orphan spec error
    pub fn orphan(msg: impl Into<String>) -> Self {
        Error::OrphanSpec(msg.into())
    }

    /// Create a not-ready error
    pub fn not_ready(msg: impl Into<String>, retry_after: Duration) -> Self {
        Error::NotReady {
            message: msg.into(),
            retry_after,
        }
    }

    /// Wrap with the name of the task that produced the error
    pub fn in_task(self, task: impl Into<String>) -> Self {
        Error::Task {
            task: task.into(),
            source: Box::new(self),
        }
    }

    pub fn is_remote_not_found(&self) -> bool {
        match self {
            Error::RemoteNotFound(_) => true,
            Error::Task { source, .. } => source.is_remote_not_found(),
            _ => false,
        }
    }

    /// Classify into the closed set of sync outcomes
    pub fn classify(&self) -> SyncError {
        match self {
            Error::Task { source, .. } => match source.classify() {
                SyncError::Transient(_) => SyncError::Transient(self.to_string()),
                other => other,
            },
            Error::Unsynced(outcome) => outcome.clone(),
            Error::Finalizer(e) => match e.as_ref() {
                FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => {
                    inner.classify()
                }
                _ => SyncError::Transient(self.to_string()),
            },
            Error::InvalidSpec(m) => SyncError::Invalid(m.clone()),
            Error::SecretKeyNotFound { .. } | Error::Config(_) => {
                SyncError::Invalid(self.to_string())
            }
            Error::OrphanSpec(m) => SyncError::Orphan(m.clone()),
            Error::SecretNotFound(_) => SyncError::Orphan(self.to_string()),
            Error::NotReady {
                message,
                retry_after,
            } => SyncError::Wait {
                message: message.clone(),
                retry_after: *retry_after,
            },
            _ => SyncError::Transient(self.to_string()),
        }
    }
}
