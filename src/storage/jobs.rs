//! Job rows and state transitions
//!
//! ```text
//!   pending ──claim──▶ queued ──mark_running──▶ running ──▶ deleted / re-inserted
//!      ▲                  │                        │
//!      └──── revert ──────┘◀──────── release ──────┘
//! ```
//!
//! Every transition names the state it expects to leave, so a row that has
//! already moved on is left untouched.

use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::Row;

use super::{JobStore, StorageError, StorageResult};

/// Lifecycle state of a job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `available_at`
    Pending,
    /// Claimed by the fetcher, not yet picked up by a worker
    Queued,
    /// A worker owns the job
    Running,
}

impl JobState {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            other => Err(StorageError::InvalidState(other.to_string())),
        }
    }
}

/// A row of the `jobs` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    pub data: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

impl TryFrom<&Row> for JobRecord {
    type Error = StorageError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let state: String = row.try_get("state")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            data: row.try_get("data")?,
            state: state.parse()?,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
        })
    }
}

/// Row to insert directly, bypassing a provider
///
/// Unset timestamps default to `NOW()` and an unset id comes from the
/// sequence.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Option<i64>,
    pub name: String,
    pub data: String,
    pub state: JobState,
    pub created_at: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// A pending job that is due immediately
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            data: String::new(),
            state: JobState::Pending,
            created_at: None,
            available_at: None,
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the payload
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the state
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    /// Set the creation time
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set the earliest claim time
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

const JOB_COLUMNS: &str = "id, name, data, state, created_at, available_at";

const CLAIM_PENDING_JOBS: &str = r#"
    WITH selected_jobs AS (
        SELECT id
        FROM jobs
        WHERE state = 'pending' AND available_at <= NOW()
        ORDER BY available_at ASC, id ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    )
    UPDATE jobs
    SET state = 'queued'
    FROM selected_jobs
    WHERE jobs.id = selected_jobs.id AND jobs.state = 'pending'
    RETURNING jobs.id, jobs.name, jobs.data, jobs.state, jobs.created_at, jobs.available_at
"#;

fn rows_to_records(rows: &[Row]) -> StorageResult<Vec<JobRecord>> {
    rows.iter().map(JobRecord::try_from).collect()
}

impl JobStore {
    /// Claim every due pending job, moving it to `queued`
    ///
    /// `limit` caps the batch; `None` claims all due rows. Rows come back in
    /// ascending `available_at`, ties broken by ascending id.
    pub async fn claim_pending(&self, limit: Option<i64>) -> StorageResult<Vec<JobRecord>> {
        let client = self.client().await?;
        let rows = client.query(CLAIM_PENDING_JOBS, &[&limit]).await?;

        // RETURNING does not preserve the CTE order
        let mut jobs = rows_to_records(&rows)?;
        jobs.sort_by(|a, b| {
            a.available_at
                .cmp(&b.available_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(jobs)
    }

    /// Put queued jobs back to `pending`
    ///
    /// Returns the number of rows reverted. An empty id list does nothing.
    pub async fn revert_to_pending(&self, ids: &[i64]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let reverted = client
            .execute(
                "UPDATE jobs SET state = 'pending' WHERE id = ANY($1) AND state = 'queued'",
                &[&ids],
            )
            .await?;

        Ok(reverted)
    }

    /// Take ownership of a queued job
    ///
    /// Returns `false` if the job is no longer queued.
    pub async fn mark_running(&self, id: i64) -> StorageResult<bool> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE jobs SET state = 'running' WHERE id = $1 AND state = 'queued'",
                &[&id],
            )
            .await?;

        Ok(updated == 1)
    }

    /// Hand a running job back to the queue, eligible again at `available_at`
    pub async fn release(&self, id: i64, available_at: DateTime<Utc>) -> StorageResult<bool> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE jobs SET state = 'pending', available_at = $2 WHERE id = $1 AND state = 'running'",
                &[&id, &available_at],
            )
            .await?;

        Ok(updated == 1)
    }

    /// Return every queued or running job to `pending`
    ///
    /// Meant for startup, before any fetcher or worker is running.
    pub async fn recover_stranded(&self) -> StorageResult<u64> {
        let client = self.client().await?;
        let recovered = client
            .execute(
                "UPDATE jobs SET state = 'pending' WHERE state IN ('queued', 'running')",
                &[],
            )
            .await?;

        Ok(recovered)
    }

    /// All jobs ordered by id
    pub async fn list_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC"),
                &[],
            )
            .await?;

        rows_to_records(&rows)
    }

    /// Jobs of one kind ordered by id
    pub async fn jobs_named(&self, name: &str) -> StorageResult<Vec<JobRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = $1 ORDER BY id ASC"),
                &[&name],
            )
            .await?;

        rows_to_records(&rows)
    }

    /// Insert a row as given
    pub async fn insert_job(&self, job: &NewJob) -> StorageResult<JobRecord> {
        let client = self.client().await?;
        let row = client
            .query_one(
                &format!(
                    r#"
                    INSERT INTO jobs (id, name, data, state, created_at, available_at)
                    VALUES (
                        COALESCE($1, nextval(pg_get_serial_sequence('jobs', 'id'))),
                        $2, $3, $4,
                        COALESCE($5, NOW()),
                        COALESCE($6, NOW())
                    )
                    RETURNING {JOB_COLUMNS}
                    "#
                ),
                &[
                    &job.id,
                    &job.name,
                    &job.data,
                    &job.state.as_str(),
                    &job.created_at,
                    &job.available_at,
                ],
            )
            .await?;

        JobRecord::try_from(&row)
    }

    /// Move the id sequence past the largest id in the table
    ///
    /// Needed after inserting rows with explicit ids.
    pub async fn sync_id_sequence(&self) -> StorageResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "SELECT setval(pg_get_serial_sequence('jobs', 'id'), COALESCE((SELECT MAX(id) FROM jobs), 0) + 1, false)",
                &[],
            )
            .await?;
        Ok(())
    }
}

/// Replace every row of a kind with a single pending row
///
/// `available_at = None` makes the job due immediately. Runs inside the
/// caller's transaction; the caller commits.
pub async fn replace_singleton(
    tx: &Transaction<'_>,
    name: &str,
    data: &str,
    available_at: Option<DateTime<Utc>>,
) -> StorageResult<()> {
    tx.execute("DELETE FROM jobs WHERE name = $1", &[&name])
        .await?;

    tx.execute(
        "INSERT INTO jobs (name, data, available_at) VALUES ($1, $2, COALESCE($3, NOW()))",
        &[&name, &data, &available_at],
    )
    .await?;

    Ok(())
}

/// Delete one job inside the caller's transaction
pub async fn delete_job(tx: &Transaction<'_>, id: i64) -> StorageResult<bool> {
    let deleted = tx.execute("DELETE FROM jobs WHERE id = $1", &[&id]).await?;
    Ok(deleted == 1)
}
