//! Execution loop
//!
//! Workers pull claimed jobs off the channel, take ownership of the row and
//! run the job through its provider. Whatever happens, the row ends up
//! rescheduled, deleted or back in `pending`; nothing is left `running`
//! unless the store itself is unreachable.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::channel::JobReceiver;
use super::registry::RegisteredJobs;
use super::{JobError, JobFinishInformation, JobProvider, JobResult, JobRunContext};
use crate::config::SchedulerConfig;
use crate::storage::jobs::delete_job;
use crate::storage::{JobRecord, StorageError};

/// Timing policy for the execution loop
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker tasks
    pub workers: usize,

    /// Upper bound for a single run
    pub job_timeout: Duration,

    /// Delay before a failed job is due again
    pub failure_retry: Duration,

    /// Delay before a job with no provider is due again
    pub unknown_kind_retry: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for ExecutorConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            workers: config.workers,
            job_timeout: config.job_timeout(),
            failure_retry: config.failure_retry(),
            unknown_kind_retry: config.unknown_kind_retry(),
        }
    }
}

/// How a single job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The row was no longer queued; someone else owns it
    Skipped,
    /// Cancellation fired before the job started; the row went back to `pending`
    NotStarted,
    /// No provider for the kind; released with the unknown-kind delay
    Orphaned,
    /// Deserialize, run or finish failed; released with the failure delay
    Failed,
    /// The job stopped on cancellation; released immediately
    Reverted,
    /// The provider stored the next run
    Rescheduled { at: DateTime<Utc> },
    /// No reschedule requested; the row was deleted
    Completed,
}

fn due_after(delay: Duration) -> DateTime<Utc> {
    let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Runs claimed jobs
pub struct JobExecutor {
    registry: Arc<RegisteredJobs>,
    context: Arc<dyn JobRunContext>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<RegisteredJobs>,
        context: Arc<dyn JobRunContext>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            context,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start `config.workers` workers sharing `receiver`
    ///
    /// Workers stop taking jobs once `cancel` fires. A running job sees the
    /// same token, so it is cancelled and its row released back to `pending`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        receiver: JobReceiver,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker_id| {
                let executor = Arc::clone(self);
                let receiver = receiver.clone();
                let cancel = cancel.clone();

                tokio::spawn(
                    async move { executor.worker_loop(receiver, cancel).await }
                        .instrument(info_span!("job_worker", worker_id)),
                )
            })
            .collect()
    }

    async fn worker_loop(&self, receiver: JobReceiver, cancel: CancellationToken) {
        debug!("Worker started");
        let mut processed: u64 = 0;

        loop {
            let Some(job) = receiver.recv(&cancel).await else {
                break;
            };

            let job_id = job.id;
            match self.execute(job, &cancel).await {
                Ok(outcome) => debug!(job_id, ?outcome, "Job handled"),
                Err(e) => {
                    let e = crate::Error::from(e);
                    error!(
                        job_id,
                        error = %e,
                        category = %e.category(),
                        "Job handling failed"
                    );
                }
            }
            processed += 1;
        }

        debug!(processed, "Worker stopped");
    }

    /// Run one claimed job and settle its row
    ///
    /// `Err` means the store could not be reached while settling the row.
    pub async fn execute(
        &self,
        job: JobRecord,
        cancel: &CancellationToken,
    ) -> JobResult<ExecutionOutcome> {
        let span = info_span!("job", job_id = job.id, job_name = %job.name);
        self.execute_inner(job, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        job: JobRecord,
        cancel: &CancellationToken,
    ) -> JobResult<ExecutionOutcome> {
        let store = self.context.store();

        // Received just as shutdown began: hand it back untouched
        if cancel.is_cancelled() {
            store.revert_to_pending(&[job.id]).await?;
            debug!("Reverted job received during shutdown");
            return Ok(ExecutionOutcome::NotStarted);
        }

        match store.mark_running(job.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job is no longer queued, skipping");
                return Ok(ExecutionOutcome::Skipped);
            }
            Err(e) => {
                // Leave the row claimable again rather than stuck in queued
                if let Err(revert_err) = store.revert_to_pending(&[job.id]).await {
                    warn!(error = %revert_err, "Failed to revert job after mark_running error");
                }
                return Err(e.into());
            }
        }

        let Some(provider) = self.registry.lookup(&job.name) else {
            let e = JobError::UnknownKind(job.name.clone());
            error!(error = %e, "Cannot run job");
            self.release(&job, self.config.unknown_kind_retry).await?;
            return Ok(ExecutionOutcome::Orphaned);
        };

        let runnable = match provider.deserialize(&job.data) {
            Ok(runnable) => runnable,
            Err(e) => {
                warn!(error = %e, "Failed to deserialize job");
                self.release(&job, self.config.failure_retry).await?;
                return Ok(ExecutionOutcome::Failed);
            }
        };

        let timeout = self.config.job_timeout;
        let result = match tokio::time::timeout(timeout, runnable.run(self.context.as_ref(), cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(timeout)),
        };

        match result {
            Ok(finish) => match self.apply_finish(&job, provider.as_ref(), &finish).await {
                Ok(outcome) => {
                    info!(successful = finish.successful, ?outcome, "Job finished");
                    Ok(outcome)
                }
                Err(e) => {
                    error!(error = %e, "Failed to apply job result");
                    self.release(&job, self.config.failure_retry).await?;
                    Ok(ExecutionOutcome::Failed)
                }
            },
            Err(e) if e.is_cancelled() => {
                info!("Job cancelled, returning to queue");
                self.release(&job, Duration::ZERO).await?;
                Ok(ExecutionOutcome::Reverted)
            }
            Err(e) => {
                warn!(error = %e, recoverable = e.is_recoverable(), "Job failed");
                self.release(&job, self.config.failure_retry).await?;
                Ok(ExecutionOutcome::Failed)
            }
        }
    }

    /// Reschedule through the provider or delete the row, in one transaction
    async fn apply_finish(
        &self,
        job: &JobRecord,
        provider: &dyn JobProvider,
        finish: &JobFinishInformation,
    ) -> JobResult<ExecutionOutcome> {
        let mut client = self.context.store().client().await?;
        let tx = client.transaction().await.map_err(StorageError::from)?;

        let outcome = match &finish.reschedule {
            Some(info) => {
                provider.save(&tx, info).await?;
                ExecutionOutcome::Rescheduled { at: info.at }
            }
            None => {
                delete_job(&tx, job.id).await?;
                ExecutionOutcome::Completed
            }
        };

        tx.commit().await.map_err(StorageError::from)?;
        Ok(outcome)
    }

    async fn release(&self, job: &JobRecord, delay: Duration) -> JobResult<()> {
        let at = due_after(delay);
        let released = self.context.store().release(job.id, at).await?;
        if released {
            debug!(available_at = %at, "Released job");
        } else {
            warn!("Job was not running when released");
        }
        Ok(())
    }
}
