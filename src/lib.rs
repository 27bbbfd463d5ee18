//! coc-tracker - durable polling job scheduler for the Clash of Clans API
//!
//! Jobs are rows in a PostgreSQL table. A fetch loop claims the ones that are
//! due, a pool of workers runs them against the rate-limited API, and every
//! job ends up rescheduled, deleted or back in the queue. Claimed jobs are
//! never lost on shutdown.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`tracker`] - Service lifecycle, API client and key pool
//! - [`jobs`] - Job kinds, registry, fetch loop and execution loop
//! - [`storage`] - Job store and schema migrations (PostgreSQL)
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use coc_tracker::config::Config;
//! use coc_tracker::tracker::Tracker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let tracker = Tracker::new(config).await?;
//!     tracker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod storage;
pub mod tracker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::jobs::{
        Job, JobError, JobExecutor, JobFetcher, JobFinishInformation, JobProvider, JobRunContext,
        RegisteredJobs, ScheduleInformation,
    };
    pub use crate::storage::{JobRecord, JobState, JobStore};
    pub use crate::tracker::keys::KeyPool;
    pub use crate::tracker::Tracker;
}

// Direct re-exports for convenience
pub use error::{Error, Result};
