//! Durable job scheduling
//!
//! Jobs live in the `jobs` table and move through a small state machine
//! (see [`crate::storage::jobs`]). A single fetcher claims due rows and feeds
//! them into a bounded channel; a pool of workers runs each one through the
//! provider registered for its kind.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  JobStore   │────▶│ JobFetcher  │────▶│ JobExecutor │──▶ provider.save / delete
//! │  (claim)    │     │             │     │  workers    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!       ▲                   │ cancel: drain + revert
//!       └───────────────────┘
//! ```
//!
//! - [`registry`] - job kind name to provider mapping and startup self-heal
//! - [`channel`] - bounded hand-off the fetcher can drain
//! - [`fetch`] - poll, claim and push loop
//! - [`execute`] - worker pool and finish policy
//! - [`update`] - bundled job kinds

pub mod channel;
pub mod error;
pub mod execute;
pub mod fetch;
pub mod registry;
pub mod update;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use deadpool_postgres::Transaction;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::storage::JobStore;
use crate::tracker::client::{ApiResponse, ClientError};

pub use channel::{job_channel, JobReceiver, JobSender};
pub use error::{JobError, JobResult, ProviderFailure};
pub use execute::{ExecutionOutcome, ExecutorConfig, JobExecutor};
pub use fetch::JobFetcher;
pub use registry::RegisteredJobs;

/// When a job should run next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInformation {
    /// Earliest time the job may be claimed again
    pub at: DateTime<Utc>,

    /// Replacement payload; the provider keeps its own when unset
    pub data: Option<serde_json::Value>,
}

impl ScheduleInformation {
    /// Schedule at an absolute time
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at, data: None }
    }

    /// Schedule relative to now
    pub fn after(delay: TimeDelta) -> Self {
        Self::at(Utc::now() + delay)
    }

    /// Attach a payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// What a job decided when it finished
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinishInformation {
    /// Whether the job did its work
    pub successful: bool,

    /// Next run; `None` removes the job for good
    pub reschedule: Option<ScheduleInformation>,
}

impl JobFinishInformation {
    pub fn succeeded(reschedule: Option<ScheduleInformation>) -> Self {
        Self {
            successful: true,
            reschedule,
        }
    }

    pub fn failed(reschedule: Option<ScheduleInformation>) -> Self {
        Self {
            successful: false,
            reschedule,
        }
    }
}

/// Services available to a running job
#[async_trait]
pub trait JobRunContext: Send + Sync {
    /// Job store, for jobs that persist results
    fn store(&self) -> &JobStore;

    /// GET a path of the remote API with a key from the pool
    async fn get(&self, cancel: &CancellationToken, path: &str) -> Result<ApiResponse, ClientError>;
}

/// A runnable unit produced by a [`JobProvider`]
#[async_trait]
pub trait Job: Send + Sync {
    /// Do the work
    ///
    /// Implementations should return [`JobError::Cancelled`] when they stop
    /// because `cancel` fired, so the row goes back to the queue untouched.
    async fn run(
        &self,
        ctx: &dyn JobRunContext,
        cancel: &CancellationToken,
    ) -> JobResult<JobFinishInformation>;

    /// Write this job to the store, replacing any previous row of its kind
    async fn serialize(&self, store: &JobStore) -> JobResult<()>;
}

/// Factory and persistence hooks for one job kind
#[async_trait]
pub trait JobProvider: Send + Sync {
    /// Kind name stored in `jobs.name`
    fn job_name(&self) -> &str;

    /// Build a job from its stored payload
    fn deserialize(&self, data: &str) -> JobResult<Box<dyn Job>>;

    /// Persist a reschedule inside the caller's transaction
    async fn save(&self, tx: &Transaction<'_>, info: &ScheduleInformation) -> JobResult<()>;

    /// Make sure the kind's row exists
    async fn check_jobs_table(&self, store: &JobStore) -> JobResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_after_is_in_future() {
        let before = Utc::now();
        let info = ScheduleInformation::after(TimeDelta::hours(1));
        assert!(info.at >= before + TimeDelta::hours(1));
        assert!(info.data.is_none());
    }

    #[test]
    fn test_finish_constructors() {
        let done = JobFinishInformation::succeeded(None);
        assert!(done.successful);
        assert!(done.reschedule.is_none());

        let retry = JobFinishInformation::failed(Some(ScheduleInformation::after(
            TimeDelta::minutes(5),
        )));
        assert!(!retry.successful);
        assert!(retry.reschedule.is_some());
    }
}
