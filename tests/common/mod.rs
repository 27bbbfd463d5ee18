//! Common test utilities
//!
//! Database tests run against the PostgreSQL instance named by
//! `TEST_DATABASE_URL`. When it is unset they print a notice and pass.

#![allow(dead_code)]

use chrono::{DateTime, TimeDelta, Utc};
use coc_tracker::storage::{run_migrations, JobRecord, JobState, JobStore, NewJob};
use std::path::Path;

/// Timestamps read back from the database may drift this much
pub fn time_tolerance() -> TimeDelta {
    TimeDelta::milliseconds(500)
}

/// Fresh, migrated and emptied store, or `None` when no database is configured
pub async fn test_store() -> Option<JobStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL is not set, skipping database test");
        return None;
    };

    let store = JobStore::from_url(&url, 8).expect("valid TEST_DATABASE_URL");
    let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    run_migrations(&store, &migrations)
        .await
        .expect("migrations apply");
    allow_all_transitions(&store).await;

    store
        .client()
        .await
        .expect("database reachable")
        .batch_execute("TRUNCATE jobs, capital_leagues RESTART IDENTITY")
        .await
        .expect("tables truncated");

    Some(store)
}

/// Five pending jobs; four are due, the last one is an hour in the future
///
/// Due order is 1, 3, 4, 2.
pub fn mock_jobs(now: DateTime<Utc>) -> Vec<JobRecord> {
    [(1, -5), (2, -1), (3, -3), (4, -2), (5, 1)]
        .into_iter()
        .map(|(id, hours)| {
            let at = now + TimeDelta::hours(hours);
            JobRecord {
                id,
                name: format!("Job {id}"),
                data: "{}".to_string(),
                state: JobState::Pending,
                created_at: at,
                available_at: at,
            }
        })
        .collect()
}

/// Insert records exactly as given and move the id sequence past them
pub async fn insert_jobs(store: &JobStore, jobs: &[JobRecord]) {
    for job in jobs {
        let new_job = NewJob::new(job.name.clone())
            .with_id(job.id)
            .with_data(job.data.clone())
            .with_state(job.state)
            .created_at(job.created_at)
            .available_at(job.available_at);
        store.insert_job(&new_job).await.expect("job inserted");
    }
    store.sync_id_sequence().await.expect("sequence synced");
}

/// Insert a single queued job due now
pub async fn insert_queued(store: &JobStore, name: &str, data: &str) -> JobRecord {
    store
        .insert_job(
            &NewJob::new(name)
                .with_data(data)
                .with_state(JobState::Queued),
        )
        .await
        .expect("job inserted")
}

pub fn approx_eq(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: TimeDelta) -> bool {
    (a - b).abs() <= tolerance
}

/// Assert the `jobs` table holds exactly `expected` (ordered by id)
pub async fn assert_jobs_table_equals(store: &JobStore, expected: &[JobRecord]) {
    let actual = store.list_jobs().await.expect("jobs listed");

    let summary = |jobs: &[JobRecord]| -> Vec<(i64, String, String, JobState)> {
        jobs.iter()
            .map(|j| (j.id, j.name.clone(), j.data.clone(), j.state))
            .collect()
    };
    assert_eq!(summary(&actual), summary(expected), "jobs table mismatch");

    for (a, e) in actual.iter().zip(expected) {
        assert!(
            approx_eq(a.created_at, e.created_at, time_tolerance()),
            "job {} created_at {} != {}",
            a.id,
            a.created_at,
            e.created_at
        );
        assert!(
            approx_eq(a.available_at, e.available_at, time_tolerance()),
            "job {} available_at {} != {}",
            a.id,
            a.available_at,
            e.available_at
        );
    }
}

/// Ids of a claimed batch in claim order
pub fn ids(jobs: &[JobRecord]) -> Vec<i64> {
    jobs.iter().map(|j| j.id).collect()
}

/// Make every `UPDATE` that moves a job into `state` fail
///
/// Stays in place until [`allow_all_transitions`] or the next `test_store`.
pub async fn refuse_transitions_to(store: &JobStore, state: JobState) {
    let sql = format!(
        r#"
        CREATE OR REPLACE FUNCTION refuse_job_transition() RETURNS trigger
        LANGUAGE plpgsql AS $$
        BEGIN
            IF NEW.state = TG_ARGV[0] THEN
                RAISE EXCEPTION 'job transition to % refused', NEW.state;
            END IF;
            RETURN NEW;
        END
        $$;
        DROP TRIGGER IF EXISTS refuse_job_transition ON jobs;
        CREATE TRIGGER refuse_job_transition BEFORE UPDATE ON jobs
            FOR EACH ROW EXECUTE FUNCTION refuse_job_transition('{}');
        "#,
        state.as_str()
    );
    store
        .client()
        .await
        .expect("database reachable")
        .batch_execute(&sql)
        .await
        .expect("trigger installed");
}

pub async fn allow_all_transitions(store: &JobStore) {
    store
        .client()
        .await
        .expect("database reachable")
        .batch_execute("DROP TRIGGER IF EXISTS refuse_job_transition ON jobs")
        .await
        .expect("trigger dropped");
}

/// Poll until `count` rows are in `state`
pub async fn wait_for_state(store: &JobStore, state: JobState, count: usize) {
    tokio::time::timeout(std::time::Duration::from_secs(3), async {
        loop {
            let matching = store
                .list_jobs()
                .await
                .expect("jobs listed")
                .iter()
                .filter(|j| j.state == state)
                .count();
            if matching == count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {count} jobs in {state:?}"));
}
