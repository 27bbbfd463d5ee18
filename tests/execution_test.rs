//! Execution loop tests against a real database

mod common;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use coc_tracker::jobs::{
    job_channel, ExecutionOutcome, ExecutorConfig, Job, JobError, JobExecutor, JobFetcher,
    JobFinishInformation, JobProvider, JobResult, JobRunContext, RegisteredJobs,
    ScheduleInformation,
};
use coc_tracker::storage::jobs::replace_singleton;
use coc_tracker::storage::{JobRecord, JobState, JobStore, NewJob};
use coc_tracker::tracker::client::{ApiResponse, ClientError};
use deadpool_postgres::Transaction;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KIND: &str = "test/Scripted";

/// Behaves according to its payload
struct ScriptedJob {
    script: String,
}

#[async_trait]
impl Job for ScriptedJob {
    async fn run(
        &self,
        _ctx: &dyn JobRunContext,
        cancel: &CancellationToken,
    ) -> JobResult<JobFinishInformation> {
        match self.script.as_str() {
            "reschedule" => Ok(JobFinishInformation::succeeded(Some(
                ScheduleInformation::after(TimeDelta::hours(2)),
            ))),
            "done" => Ok(JobFinishInformation::succeeded(None)),
            "fail" => Err(JobError::execution("scripted failure")),
            "cancel" => Err(JobError::Cancelled),
            "wait" => {
                cancel.cancelled().await;
                Err(JobError::Cancelled)
            }
            "slow" => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(JobFinishInformation::succeeded(None))
            }
            other => Err(JobError::execution(format!("unknown script {other}"))),
        }
    }

    async fn serialize(&self, _store: &JobStore) -> JobResult<()> {
        Ok(())
    }
}

struct ScriptedProvider;

#[async_trait]
impl JobProvider for ScriptedProvider {
    fn job_name(&self) -> &str {
        KIND
    }

    fn deserialize(&self, data: &str) -> JobResult<Box<dyn Job>> {
        if data == "garbage" {
            return Err(JobError::Deserialize {
                job_name: KIND.to_string(),
                reason: "garbage payload".to_string(),
            });
        }
        Ok(Box::new(ScriptedJob {
            script: data.to_string(),
        }))
    }

    async fn save(&self, tx: &Transaction<'_>, info: &ScheduleInformation) -> JobResult<()> {
        replace_singleton(tx, KIND, "reschedule", Some(info.at)).await?;
        Ok(())
    }

    async fn check_jobs_table(&self, _store: &JobStore) -> JobResult<()> {
        Ok(())
    }
}

struct OfflineContext {
    store: JobStore,
}

#[async_trait]
impl JobRunContext for OfflineContext {
    fn store(&self) -> &JobStore {
        &self.store
    }

    async fn get(&self, _cancel: &CancellationToken, path: &str) -> Result<ApiResponse, ClientError> {
        Err(ClientError::InvalidUrl(format!("offline: {path}")))
    }
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        workers: 2,
        job_timeout: Duration::from_millis(200),
        failure_retry: Duration::from_secs(60),
        unknown_kind_retry: Duration::from_secs(600),
    }
}

fn executor(store: &JobStore) -> Arc<JobExecutor> {
    executor_with(store, config())
}

fn executor_with(store: &JobStore, config: ExecutorConfig) -> Arc<JobExecutor> {
    let mut registry = RegisteredJobs::new();
    registry.register(ScriptedProvider);
    Arc::new(JobExecutor::new(
        Arc::new(registry),
        Arc::new(OfflineContext {
            store: store.clone(),
        }),
        config,
    ))
}

#[tokio::test]
#[serial]
async fn test_successful_job_is_rescheduled_by_provider() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = common::insert_queued(&store, KIND, "reschedule").await;

    let outcome = executor(&store)
        .execute(job.clone(), &CancellationToken::new())
        .await
        .unwrap();

    let at = match outcome {
        ExecutionOutcome::Rescheduled { at } => at,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!(common::approx_eq(
        at,
        Utc::now() + TimeDelta::hours(2),
        TimeDelta::seconds(5)
    ));

    let rows = store.jobs_named(KIND).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].id, job.id);
    assert_eq!(rows[0].state, JobState::Pending);
    assert!(common::approx_eq(rows[0].available_at, at, common::time_tolerance()));
}

#[tokio::test]
#[serial]
async fn test_job_without_reschedule_is_deleted() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = common::insert_queued(&store, KIND, "done").await;

    let outcome = executor(&store)
        .execute(job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert!(store.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_failing_job_returns_to_pending_with_delay() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let executor = executor(&store);

    for script in ["fail", "slow", "garbage"] {
        let job = common::insert_queued(&store, KIND, script).await;
        let outcome = executor
            .execute(job.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failed, "script {script}");

        let row = store
            .list_jobs()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.id == job.id)
            .expect("row kept");
        assert_eq!(row.state, JobState::Pending);
        assert!(common::approx_eq(
            row.available_at,
            Utc::now() + TimeDelta::seconds(60),
            TimeDelta::seconds(5)
        ));
    }
}

#[tokio::test]
#[serial]
async fn test_cancelled_job_is_released_immediately() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = common::insert_queued(&store, KIND, "cancel").await;

    let outcome = executor(&store)
        .execute(job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Reverted);
    let rows = store.list_jobs().await.unwrap();
    assert_eq!(rows[0].state, JobState::Pending);
    assert!(common::approx_eq(
        rows[0].available_at,
        Utc::now(),
        TimeDelta::seconds(5)
    ));
}

#[tokio::test]
#[serial]
async fn test_unknown_kind_is_orphaned() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = common::insert_queued(&store, "test/Missing", "").await;

    let outcome = executor(&store)
        .execute(job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Orphaned);
    let rows = store.list_jobs().await.unwrap();
    assert_eq!(rows[0].state, JobState::Pending);
    assert!(common::approx_eq(
        rows[0].available_at,
        Utc::now() + TimeDelta::seconds(600),
        TimeDelta::seconds(5)
    ));
}

#[tokio::test]
#[serial]
async fn test_job_no_longer_queued_is_skipped() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = store
        .insert_job(&NewJob::new(KIND).with_data("done"))
        .await
        .unwrap();

    let outcome = executor(&store)
        .execute(job.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Skipped);
    common::assert_jobs_table_equals(&store, &[job]).await;
}

#[tokio::test]
#[serial]
async fn test_job_received_at_shutdown_is_handed_back() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let job = common::insert_queued(&store, KIND, "done").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = executor(&store).execute(job.clone(), &cancel).await.unwrap();

    assert_eq!(outcome, ExecutionOutcome::NotStarted);
    let expected = JobRecord {
        state: JobState::Pending,
        ..job
    };
    common::assert_jobs_table_equals(&store, &[expected]).await;
}

#[tokio::test]
#[serial]
async fn test_workers_drain_queue_end_to_end() {
    let Some(store) = common::test_store().await else {
        return;
    };
    let past = Utc::now() - TimeDelta::minutes(1);
    for _ in 0..6 {
        store
            .insert_job(&NewJob::new(KIND).with_data("done").available_at(past))
            .await
            .unwrap();
    }
    // Waits for cancellation, then must come back as pending
    store
        .insert_job(&NewJob::new(KIND).with_data("wait").available_at(past))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (sender, receiver) = job_channel(4);
    let fetcher = JobFetcher::new(store.clone(), Duration::from_millis(50));
    let fetch_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { fetcher.run(cancel, sender).await }
    });
    let config = ExecutorConfig {
        job_timeout: Duration::from_secs(30),
        ..config()
    };
    let workers = executor_with(&store, config).spawn_workers(receiver, cancel.clone());
    assert_eq!(workers.len(), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let remaining = store.list_jobs().await.unwrap();
            if remaining.len() == 1 && remaining[0].state == JobState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("queue never drained");

    cancel.cancel();
    tokio_test::assert_ok!(fetch_handle.await.unwrap());
    for worker in workers {
        worker.await.unwrap();
    }

    let remaining = store.list_jobs().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].data, "wait");
    assert_eq!(remaining[0].state, JobState::Pending);
}
