//! Tracker service
//!
//! Wires the key pool, API client, job store and job loops together and owns
//! the process lifecycle: prepare the database, run until a shutdown signal,
//! then stop the loops without losing claimed jobs.
//!
//! # Example
//!
//! ```no_run
//! use coc_tracker::config::Config;
//! use coc_tracker::tracker::Tracker;
//!
//! # async fn example() -> coc_tracker::Result<()> {
//! let config = Config::from_env()?;
//! let tracker = Tracker::new(config).await?;
//! tracker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod keys;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jobs::{
    job_channel, update, ExecutorConfig, JobExecutor, JobFetcher, JobRunContext, RegisteredJobs,
};
use crate::storage::{run_migrations, JobStore};

use client::{ApiClient, ApiResponse, ClientError};
use keys::{KeyPool, KeyPoolError};

/// Register every job kind this build knows about
pub fn register_all_job_kinds(registry: &mut RegisteredJobs) {
    update::register_all(registry);
}

/// What a running job sees: the store and the rate-limited API client
#[derive(Debug, Clone)]
pub struct TrackerContext {
    store: JobStore,
    client: Arc<ApiClient>,
}

impl TrackerContext {
    pub fn new(store: JobStore, client: Arc<ApiClient>) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl JobRunContext for TrackerContext {
    fn store(&self) -> &JobStore {
        &self.store
    }

    async fn get(&self, cancel: &CancellationToken, path: &str) -> std::result::Result<ApiResponse, ClientError> {
        self.client.get(cancel, path).await
    }
}

/// The assembled service
pub struct Tracker {
    config: Config,
    store: JobStore,
    client: Arc<ApiClient>,
    registry: Arc<RegisteredJobs>,
    cancel: CancellationToken,
}

impl Tracker {
    /// Load keys, build the HTTP client and the database pool, register job kinds
    ///
    /// Fails if the key file is missing or empty. No database connection is
    /// opened yet.
    pub async fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config(format!("{e:#}")))?;

        let quota = keys::quota(config.keys.rate_per_second, config.keys.burst)
            .ok_or(KeyPoolError::InvalidQuota)?;
        let pool = KeyPool::load_from_file(&config.keys.file, quota).await?;
        info!(keys = pool.len(), file = %config.keys.file.display(), "Loaded API keys");

        let client = ApiClient::new(
            &config.api.base_url,
            config.request_timeout(),
            Arc::new(pool),
        )?;

        let store = JobStore::new(&config.database)?;

        let mut registry = RegisteredJobs::new();
        register_all_job_kinds(&mut registry);
        info!(kinds = ?registry.names(), "Registered job kinds");

        Ok(Self {
            config,
            store,
            client: Arc::new(client),
            registry: Arc::new(registry),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the tracker when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or the cancellation token fires
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            store,
            client,
            registry,
            cancel,
        } = self;

        store.ping().await?;
        info!("Connected to database");

        info!(dir = %config.database.migrations_dir.display(), "Migrating database");
        let applied = run_migrations(&store, &config.database.migrations_dir).await?;
        info!(applied = applied.len(), "Database migrated");

        let recovered = store.recover_stranded().await?;
        if recovered > 0 {
            warn!(recovered, "Returned stranded jobs to pending");
        }

        info!("Checking jobs");
        registry.check_all(&store).await?;

        let (sender, receiver) = job_channel(config.scheduler.channel_capacity);

        let fetcher = JobFetcher::new(store.clone(), config.scheduler.poll_interval())
            .with_batch_limit(config.scheduler.claim_batch_size);
        let fetcher_handle = tokio::spawn(
            {
                let cancel = cancel.clone();
                async move { fetcher.run(cancel, sender).await }
            }
            .instrument(info_span!("job_fetcher")),
        );

        let context = Arc::new(TrackerContext::new(store.clone(), Arc::clone(&client)));
        let executor = Arc::new(JobExecutor::new(
            registry,
            context,
            ExecutorConfig::from(&config.scheduler),
        ));
        let workers = executor.spawn_workers(receiver, cancel.clone());

        info!(workers = workers.len(), "Started tracker");

        tokio::select! {
            _ = shutdown => info!("Shutdown signal received"),
            _ = cancel.cancelled() => info!("Tracker cancelled"),
        }

        info!("Stopping tracker");
        cancel.cancel();

        let fetcher_result = match fetcher_handle.await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(Error::with_source("Job fetcher task failed", e)),
        };
        if let Err(e) = &fetcher_result {
            error!(error = %e, "Job fetcher stopped with an error");
        }

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Job worker task failed");
            }
        }

        for usage in client.keys().usage() {
            info!(key = %usage.key, times_used = usage.times_used, "Key usage");
        }

        store.close();
        info!("Stopped tracker");

        fetcher_result
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
