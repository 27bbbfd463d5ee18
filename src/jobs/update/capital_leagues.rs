//! Capital league list refresh
//!
//! The league list changes rarely, so the job runs weekly and retries hourly
//! while the API is unhappy. Exactly one row of this kind exists at a time.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use deadpool_postgres::Transaction;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{
    Job, JobFinishInformation, JobProvider, JobResult, JobRunContext, ScheduleInformation,
};
use crate::storage::jobs::replace_singleton;
use crate::storage::{JobStore, StorageError};

/// Kind name stored in `jobs.name`
pub const JOB_NAME: &str = "update/FetchCapitalLeagues";

/// API path listing every capital league
pub const CAPITAL_LEAGUES_ENDPOINT: &str = "/capitalleagues";

const UPSERT_LEAGUE: &str = r#"
    INSERT INTO capital_leagues (id, name)
    VALUES ($1, $2)
    ON CONFLICT (id)
    DO UPDATE SET name = EXCLUDED.name
"#;

fn refresh_interval() -> TimeDelta {
    TimeDelta::days(7)
}

fn retry_interval() -> TimeDelta {
    TimeDelta::hours(1)
}

#[derive(Debug, Deserialize)]
struct LeagueList {
    #[serde(default)]
    items: Vec<League>,
}

#[derive(Debug, Deserialize)]
struct League {
    id: i64,
    name: String,
}

async fn replace_job(
    tx: &Transaction<'_>,
    data: &str,
    at: Option<DateTime<Utc>>,
) -> JobResult<()> {
    replace_singleton(tx, JOB_NAME, data, at).await?;
    Ok(())
}

/// Replace the kind's row with one due now, in its own transaction
async fn reset_schedule(store: &JobStore) -> JobResult<()> {
    let mut client = store.client().await?;
    let tx = client.transaction().await.map_err(StorageError::from)?;
    replace_job(&tx, "", None).await?;
    tx.commit().await.map_err(StorageError::from)?;
    Ok(())
}

/// Fetches the capital league list and upserts it into `capital_leagues`
#[derive(Debug, Default)]
pub struct FetchCapitalLeagues;

#[async_trait]
impl Job for FetchCapitalLeagues {
    async fn run(
        &self,
        ctx: &dyn JobRunContext,
        cancel: &CancellationToken,
    ) -> JobResult<JobFinishInformation> {
        let response = ctx.get(cancel, CAPITAL_LEAGUES_ENDPOINT).await?;

        if !response.is_success() {
            warn!(status = response.status, "Capital league request failed");
            return Ok(JobFinishInformation::failed(Some(
                ScheduleInformation::after(retry_interval()),
            )));
        }

        if response.cache_hit {
            debug!("Capital leagues unchanged");
            return Ok(JobFinishInformation::succeeded(Some(
                ScheduleInformation::after(refresh_interval()),
            )));
        }

        let leagues: LeagueList = response.json()?;

        let mut client = ctx.store().client().await?;
        let tx = client.transaction().await.map_err(StorageError::from)?;
        let statement = tx
            .prepare_cached(UPSERT_LEAGUE)
            .await
            .map_err(StorageError::from)?;

        for league in &leagues.items {
            tx.execute(&statement, &[&league.id, &league.name])
                .await
                .map_err(StorageError::from)?;
        }

        tx.commit().await.map_err(StorageError::from)?;

        info!(count = leagues.items.len(), "Updated capital leagues");

        Ok(JobFinishInformation::succeeded(Some(
            ScheduleInformation::after(refresh_interval()),
        )))
    }

    async fn serialize(&self, store: &JobStore) -> JobResult<()> {
        reset_schedule(store).await
    }
}

/// Provider for [`FetchCapitalLeagues`]
#[derive(Debug, Default)]
pub struct FetchCapitalLeaguesProvider;

impl FetchCapitalLeaguesProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProvider for FetchCapitalLeaguesProvider {
    fn job_name(&self) -> &str {
        JOB_NAME
    }

    fn deserialize(&self, _data: &str) -> JobResult<Box<dyn Job>> {
        Ok(Box::new(FetchCapitalLeagues))
    }

    async fn save(&self, tx: &Transaction<'_>, info: &ScheduleInformation) -> JobResult<()> {
        let data = info
            .data
            .as_ref()
            .map(serde_json::Value::to_string)
            .unwrap_or_default();
        replace_job(tx, &data, Some(info.at)).await
    }

    async fn check_jobs_table(&self, store: &JobStore) -> JobResult<()> {
        reset_schedule(store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobError;
    use crate::tracker::client::{ApiResponse, ClientError};

    struct CannedContext {
        store: JobStore,
        response: ApiResponse,
    }

    #[async_trait]
    impl JobRunContext for CannedContext {
        fn store(&self) -> &JobStore {
            &self.store
        }

        async fn get(
            &self,
            _cancel: &CancellationToken,
            path: &str,
        ) -> Result<ApiResponse, ClientError> {
            assert_eq!(path, CAPITAL_LEAGUES_ENDPOINT);
            Ok(self.response.clone())
        }
    }

    fn context(status: u16, body: &str, cache_hit: bool) -> CannedContext {
        CannedContext {
            store: JobStore::from_url("postgresql://nobody@127.0.0.1:1/none", 1).unwrap(),
            response: ApiResponse {
                status,
                body: body.to_string(),
                cache_hit,
            },
        }
    }

    #[tokio::test]
    async fn test_error_status_retries_in_an_hour() {
        let ctx = context(503, "", false);
        let before = Utc::now();

        let finish = FetchCapitalLeagues
            .run(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!finish.successful);
        let at = finish.reschedule.unwrap().at;
        assert!(at >= before + TimeDelta::hours(1));
        assert!(at < before + TimeDelta::hours(2));
    }

    #[tokio::test]
    async fn test_cache_hit_reschedules_in_a_week() {
        let ctx = context(200, r#"{"items":[]}"#, true);
        let before = Utc::now();

        let finish = FetchCapitalLeagues
            .run(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(finish.successful);
        let at = finish.reschedule.unwrap().at;
        assert!(at >= before + TimeDelta::days(7));
        assert!(at < before + TimeDelta::days(8));
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_error() {
        let ctx = context(200, "not json", false);

        let err = FetchCapitalLeagues
            .run(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Json(_)));
    }

    #[test]
    fn test_league_list_parse() {
        let list: LeagueList = serde_json::from_str(
            r#"{"items":[{"id":85000001,"name":"Bronze League III"},{"id":85000002,"name":"Bronze League II"}],"paging":{"cursors":{}}}"#,
        )
        .unwrap();

        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].id, 85000001);
        assert_eq!(list.items[1].name, "Bronze League II");
    }

    #[test]
    fn test_provider_name_and_deserialize() {
        let provider = FetchCapitalLeaguesProvider::new();
        assert_eq!(provider.job_name(), "update/FetchCapitalLeagues");
        assert!(provider.deserialize("").is_ok());
        assert!(provider.deserialize("{}").is_ok());
    }
}
