use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::ReadCacheStore;
use super::schema;
use super::sync::SyncState;
use crate::message::types::MessageId;

/// Connection pool size. One writer (the persistence task) plus startup reads.
const POOL_SIZE: u32 = 4;

/// Ids per INSERT. Each binds two parameters, which keeps a statement well
/// under SQLite's bound-variable limit.
const INSERT_CHUNK: usize = 400;

pub struct Cache {
    pool: SqlitePool,
    /// Most recent read ids kept on disk
    capacity: usize,
}

impl Cache {
    /// Get a reference to the connection pool (for tests).
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open(path: &Path, capacity: usize) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;
        tracing::info!("Opened read cache at {}", path.display());

        Ok(Self { pool, capacity })
    }

    #[cfg(test)]
    pub async fn open_in_memory(capacity: usize) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool, capacity })
    }

    //
    // Read Id Operations
    //

    pub async fn get_read_ids(&self) -> Result<Vec<MessageId>> {
        let rows = sqlx::query("SELECT id FROM read_messages ORDER BY read_at DESC, rowid DESC LIMIT ?")
            .bind(self.capacity as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Record ids as read and trim the table to the newest `capacity` rows.
    /// A re-committed id keeps its original `read_at`.
    pub async fn insert_read_ids(&self, ids: &[MessageId], read_at: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in ids.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO read_messages (id, read_at) ");
            builder.push_values(chunk, |mut row, id| {
                row.push_bind(id).push_bind(read_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let evicted = sqlx::query(
            "DELETE FROM read_messages WHERE id NOT IN \
             (SELECT id FROM read_messages ORDER BY read_at DESC, rowid DESC LIMIT ?)",
        )
        .bind(self.capacity as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if evicted > 0 {
            tracing::debug!("Evicted {} old read ids from cache", evicted);
        }
        Ok(())
    }

    pub async fn get_read_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM read_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    //
    // Sync State Operations
    //

    pub async fn get_sync_state(&self, account_id: &str) -> Result<SyncState> {
        let row = sqlx::query("SELECT cursor, last_sync FROM sync_state WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => SyncState {
                cursor: row.get("cursor"),
                last_sync: row.get("last_sync"),
            },
            None => SyncState::default(),
        })
    }

    pub async fn set_sync_state(&self, account_id: &str, state: &SyncState) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_state (account_id, cursor, last_sync) VALUES (?, ?, ?)",
        )
        .bind(account_id)
        .bind(state.cursor)
        .bind(state.last_sync)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ReadCacheStore for Cache {
    async fn load_read_ids(&self) -> Result<Vec<MessageId>> {
        self.get_read_ids().await
    }

    async fn commit_read_ids(&self, ids: &[MessageId], read_at: i64) -> Result<()> {
        self.insert_read_ids(ids, read_at).await
    }

    async fn load_sync_state(&self, account_id: &str) -> Result<SyncState> {
        self.get_sync_state(account_id).await
    }

    async fn save_sync_state(&self, account_id: &str, state: &SyncState) -> Result<()> {
        let saved = self.get_sync_state(account_id).await?;
        self.set_sync_state(account_id, &saved.merge(state)).await
    }
}
