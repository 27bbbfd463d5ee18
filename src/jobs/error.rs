//! Error types for the jobs module

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageError;
use crate::tracker::client::ClientError;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// A single provider's self-heal failure
#[derive(Debug)]
pub struct ProviderFailure {
    /// Kind name of the failing provider
    pub job_name: String,

    /// What went wrong
    pub error: JobError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.job_name, self.error)
    }
}

/// Job scheduling and execution errors
#[derive(Error, Debug)]
pub enum JobError {
    /// Job store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote API failure
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Response or payload JSON could not be handled
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No provider is registered for the job's kind
    #[error("No provider registered for job kind '{0}'")]
    UnknownKind(String),

    /// The provider rejected the stored payload
    #[error("Failed to deserialize '{job_name}' payload: {reason}")]
    Deserialize { job_name: String, reason: String },

    /// The job observed cancellation and stopped early
    #[error("Job cancelled")]
    Cancelled,

    /// The job exceeded its time budget
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// One or more providers failed their self-heal check
    #[error("{} job provider check(s) failed: {}", .0.len(), join_failures(.0))]
    CheckFailed(Vec<ProviderFailure>),

    /// Job-specific failure
    #[error("Job execution failed: {0}")]
    Execution(String),
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl JobError {
    /// Create a job-specific execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors leave the job eligible for another attempt.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Timeout(_) | Self::Execution(_) => true,
            Self::Json(_)
            | Self::UnknownKind(_)
            | Self::Deserialize { .. }
            | Self::Cancelled
            | Self::CheckFailed(_) => false,
        }
    }

    /// Whether this error reports cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Client(ClientError::Cancelled)
        )
    }
}
