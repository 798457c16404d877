//! Durable read-state cache and sync cursor.
//!
//! This module is split into:
//! - `mod.rs` - `ReadCacheStore` trait
//! - `db.rs` - SQLite implementation
//! - `schema.rs` - Database schema initialization
//! - `sync.rs` - Persisted poll cursor

mod db;
mod schema;
mod sync;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::types::MessageId;

pub use db::Cache;
pub use sync::SyncState;

/// Device-local opinion of which messages are read. Write failures are
/// never fatal: the in-session state stays authoritative.
#[async_trait]
pub trait ReadCacheStore: Send + Sync {
    async fn load_read_ids(&self) -> Result<Vec<MessageId>>;

    async fn commit_read_ids(&self, ids: &[MessageId], read_at: i64) -> Result<()>;

    async fn load_sync_state(&self, account_id: &str) -> Result<SyncState>;

    async fn save_sync_state(&self, account_id: &str, state: &SyncState) -> Result<()>;
}
