//! Schema migrations
//!
//! Migrations are plain SQL files named `<version>_<name>.up.sql`. Applied
//! versions are recorded in `schema_migrations`; each file runs in its own
//! transaction together with its bookkeeping row.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{JobStore, StorageError, StorageResult};

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

/// A migration file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
}

/// Split `0001_create_jobs.up.sql` into `(1, "create_jobs")`
///
/// Returns `None` for anything that is not an up migration.
pub fn parse_file_name(file_name: &str) -> Option<(i64, String)> {
    let stem = file_name.strip_suffix(".up.sql")?;
    let (version, name) = stem.split_once('_')?;
    if name.is_empty() {
        return None;
    }
    let version = version.parse::<i64>().ok()?;
    Some((version, name.to_string()))
}

/// Read every up migration in `dir`, ordered by version
pub async fn load_migrations(dir: &Path) -> StorageResult<Vec<Migration>> {
    let io_err = |source| StorageError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut migrations = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((version, name)) = parse_file_name(file_name) else {
            debug!(file = %path.display(), "Skipping non-migration file");
            continue;
        };

        let sql = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        migrations.push(Migration {
            version,
            name,
            path,
            sql,
        });
    }

    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(StorageError::Migration {
            file: pair[1].path.display().to_string(),
            reason: format!("duplicate version {}", pair[1].version),
        });
    }

    Ok(migrations)
}

/// Apply pending migrations from `dir`
///
/// Returns the versions applied by this call, in order.
pub async fn run_migrations(store: &JobStore, dir: &Path) -> StorageResult<Vec<i64>> {
    let migrations = load_migrations(dir).await?;

    let mut client = store.client().await?;
    client.batch_execute(CREATE_MIGRATIONS_TABLE).await?;

    let applied: Vec<i64> = client
        .query("SELECT version FROM schema_migrations", &[])
        .await?
        .iter()
        .map(|row| row.try_get::<_, i64>(0))
        .collect::<Result<_, _>>()?;

    let mut newly_applied = Vec::new();

    for migration in migrations {
        if applied.contains(&migration.version) {
            continue;
        }

        let file = migration.path.display().to_string();
        let tx = client.transaction().await?;

        tx.batch_execute(&migration.sql)
            .await
            .map_err(|e| StorageError::Migration {
                file: file.clone(),
                reason: e.to_string(),
            })?;

        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[&migration.version, &migration.name],
        )
        .await?;

        tx.commit().await?;

        info!(version = migration.version, name = %migration.name, "Applied migration");
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}
