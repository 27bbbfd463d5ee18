//! Fetch loop
//!
//! Polls the store for due jobs, claims them and feeds them to the workers.
//! On cancellation every job that was claimed but not picked up by a worker
//! goes back to `pending`.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::JobSender;
use super::JobResult;
use crate::storage::JobStore;

/// Default pause between claims
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Claims due jobs and pushes them into the job channel
#[derive(Debug, Clone)]
pub struct JobFetcher {
    store: JobStore,
    poll_interval: Duration,
    batch_limit: Option<i64>,
}

impl JobFetcher {
    pub fn new(store: JobStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            batch_limit: None,
        }
    }

    /// Cap the number of jobs claimed per poll
    pub fn with_batch_limit(mut self, limit: Option<i64>) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run until `cancel` fires
    ///
    /// Claim failures are logged and retried on the next poll. The only error
    /// returned is a failure to revert jobs during shutdown.
    pub async fn run(&self, cancel: CancellationToken, output: JobSender) -> JobResult<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_limit = ?self.batch_limit,
            "Job fetcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.drain_and_revert(&output, Vec::new()).await;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            // Not raced against cancellation: a dropped claim could leave rows queued
            let jobs = match self.store.claim_pending(self.batch_limit).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    let e = crate::Error::from(e);
                    warn!(
                        error = %e,
                        category = %e.category(),
                        recoverable = e.is_recoverable(),
                        "Failed to claim pending jobs"
                    );
                    continue;
                }
            };

            if jobs.is_empty() {
                continue;
            }

            debug!(count = jobs.len(), "Claimed jobs");

            let mut batch = jobs.into_iter();
            while let Some(job) = batch.next() {
                let id = job.id;

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    result = output.send(job) => result.is_ok(),
                };

                if !sent {
                    let unsent: Vec<i64> = std::iter::once(id).chain(batch.map(|j| j.id)).collect();
                    return self.drain_and_revert(&output, unsent).await;
                }
            }
        }
    }

    /// Return buffered and unsent jobs to `pending`
    async fn drain_and_revert(&self, output: &JobSender, mut ids: Vec<i64>) -> JobResult<()> {
        let unsent = ids.len();
        let drained = output.drain().await;
        ids.extend(drained.iter().map(|job| job.id));

        if ids.is_empty() {
            info!("Job fetcher stopped, nothing to revert");
            return Ok(());
        }

        let reverted = self.store.revert_to_pending(&ids).await?;
        info!(
            unsent,
            drained = drained.len(),
            reverted,
            "Job fetcher stopped, reverted unprocessed jobs"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::channel::job_channel;

    #[tokio::test]
    async fn test_cancel_before_first_poll_is_noop() {
        let store = JobStore::from_url("postgresql://nobody@127.0.0.1:1/none", 1).unwrap();
        let fetcher = JobFetcher::new(store, Duration::from_secs(60));
        let (tx, rx) = job_channel(2);

        let cancel = CancellationToken::new();
        cancel.cancel();

        // Nothing was claimed, so the store is never touched
        fetcher.run(cancel.clone(), tx).await.unwrap();
        assert!(rx.recv(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_with_idle_consumer_terminates() {
        let store = JobStore::from_url("postgresql://nobody@127.0.0.1:1/none", 1).unwrap();
        let fetcher = JobFetcher::new(store, Duration::from_secs(60));
        let (tx, rx) = job_channel(2);
        let cancel = CancellationToken::new();

        // A worker parked on an empty channel holds the shared receiver
        let consumer = tokio::spawn({
            let cancel = cancel.clone();
            async move { rx.recv(&cancel).await }
        });
        tokio::task::yield_now().await;

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), fetcher.run(cancel, tx))
            .await
            .expect("fetcher did not stop while a consumer was waiting");
        assert!(result.is_ok());
        assert!(consumer.await.unwrap().is_none());
    }

    #[test]
    fn test_batch_limit_builder() {
        let store = JobStore::from_url("postgresql://nobody@127.0.0.1:1/none", 1).unwrap();
        let fetcher = JobFetcher::new(store, DEFAULT_POLL_INTERVAL).with_batch_limit(Some(5));
        assert_eq!(fetcher.batch_limit, Some(5));
        assert_eq!(fetcher.poll_interval(), Duration::from_secs(1));
    }
}
