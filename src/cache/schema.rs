//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA_VERSION: i64 = 1;

/// Create the read cache and sync state tables if missing.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Known-read message ids, newest kept when trimmed
        CREATE TABLE IF NOT EXISTS read_messages (
            id TEXT PRIMARY KEY,
            read_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_read_messages_read_at ON read_messages(read_at DESC);

        CREATE TABLE IF NOT EXISTS sync_state (
            account_id TEXT PRIMARY KEY,
            cursor INTEGER,
            last_sync INTEGER
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}
