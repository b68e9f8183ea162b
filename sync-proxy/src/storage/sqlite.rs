//! SQLite storage backend for syncproxy.

use super::{TargetRecord, TargetStore};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use syncproxy_types::TargetId;

/// One schema step: a log message and the statements that apply it.
struct Upgrade {
    message: &'static str,
    statements: &'static [&'static str],
}

/// Schema steps in order. The `version` table records how many have run.
const UPGRADES: &[Upgrade] = &[Upgrade {
    message: "Initial version",
    statements: &[r#"
        CREATE TABLE targets (
            appservice_id    TEXT    PRIMARY KEY,
            bot_access_token TEXT    NOT NULL,
            hs_token         TEXT    NOT NULL,
            address          TEXT    NOT NULL,
            user_id          TEXT    NOT NULL,
            device_id        TEXT    NOT NULL,
            is_proxy         BOOLEAN NOT NULL,
            next_batch       TEXT    NOT NULL,
            active           BOOLEAN DEFAULT false
        )
        "#],
}];

/// SQLite-based target storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub async fn new(path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.upgrade().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A second connection would see a different in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.upgrade().await?;
        Ok(store)
    }

    /// Current schema version; 0 for a fresh database.
    pub async fn schema_version(&self) -> Result<i64, StorageError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM version")
            .fetch_optional(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Run every schema step newer than the stored version, each in its own
    /// transaction together with the version bump.
    async fn upgrade(&self) -> Result<(), StorageError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS version (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StorageError::Migration(format!("failed to ensure version table exists: {e}"))
            })?;

        let version = self.schema_version().await?;
        let version = usize::try_from(version).map_err(|_| {
            StorageError::Migration(format!("invalid stored schema version {version}"))
        })?;
        if version >= UPGRADES.len() {
            return Ok(());
        }

        for (index, upgrade) in UPGRADES.iter().enumerate().skip(version) {
            let new_version = index + 1;
            tracing::info!(
                "Updating database schema to v{}: {}",
                new_version,
                upgrade.message
            );
            let mut tx = self.pool.begin().await?;
            for statement in upgrade.statements {
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                    StorageError::Migration(format!(
                        "failed to upgrade database schema to v{new_version}: {e}"
                    ))
                })?;
            }
            Self::set_version(&mut tx, new_version as i64).await?;
            tx.commit().await.map_err(|e| {
                StorageError::Migration(format!(
                    "failed to commit upgrade of database schema to v{new_version}: {e}"
                ))
            })?;
        }
        tracing::info!("Database schema updated to v{}", UPGRADES.len());
        Ok(())
    }

    async fn set_version(tx: &mut Transaction<'_, Sqlite>, version: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM version")
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO version (version) VALUES (?1)")
            .bind(version)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                StorageError::Migration(format!("failed to store new version v{version}: {e}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn upsert(&self, target: &TargetRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO targets (appservice_id, bot_access_token, hs_token, address,
                                 user_id, device_id, is_proxy, next_batch, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (appservice_id) DO UPDATE SET
                bot_access_token = excluded.bot_access_token,
                hs_token = excluded.hs_token,
                address = excluded.address,
                user_id = excluded.user_id,
                device_id = excluded.device_id,
                is_proxy = excluded.is_proxy
            "#,
        )
        .bind(target.id.as_str())
        .bind(&target.bot_access_token)
        .bind(&target.hs_token)
        .bind(&target.address)
        .bind(target.user_id.as_str())
        .bind(target.device_id.as_str())
        .bind(target.is_proxy)
        .bind(&target.next_batch)
        .bind(target.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_active(&self, id: &TargetId, active: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE targets SET active = ?1 WHERE appservice_id = ?2")
            .bind(active)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_next_batch(&self, id: &TargetId, next_batch: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE targets SET next_batch = ?1 WHERE appservice_id = ?2")
            .bind(next_batch)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<TargetRecord>, StorageError> {
        let rows = sqlx::query_as::<_, TargetRow>(
            r#"
            SELECT appservice_id, bot_access_token, hs_token, address,
                   user_id, device_id, is_proxy, next_batch, active
            FROM targets
            ORDER BY appservice_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TargetRecord::from).collect())
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct TargetRow {
    appservice_id: String,
    bot_access_token: String,
    hs_token: String,
    address: String,
    user_id: String,
    device_id: String,
    is_proxy: bool,
    next_batch: String,
    active: Option<bool>,
}

impl From<TargetRow> for TargetRecord {
    fn from(row: TargetRow) -> Self {
        TargetRecord {
            id: row.appservice_id.into(),
            bot_access_token: row.bot_access_token,
            hs_token: row.hs_token,
            address: row.address,
            user_id: row.user_id.into(),
            device_id: row.device_id.into(),
            is_proxy: row.is_proxy,
            next_batch: row.next_batch,
            active: row.active.unwrap_or(false),
        }
    }
}
