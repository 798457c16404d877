//! Message store client: the canonical source of message rows.
//!
//! This module is split into:
//! - `mod.rs` - `MessageStore` trait, errors and shared types
//! - `http.rs` - REST implementation over `reqwest`
//! - `memory.rs` - scripted in-memory store for tests

mod http;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::types::{MessageId, RawMessage};

pub use http::HttpStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has no such message (deleted upstream or never existed)
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("store request failed: {0}")]
    Transient(String),
    #[error("unexpected store response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            StoreError::Decode(e.to_string())
        } else {
            StoreError::Transient(e.to_string())
        }
    }
}

/// One poll result. Snapshots and deltas look the same.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub messages: Vec<RawMessage>,
    /// Rows the store sent that could not be decoded
    pub dropped: usize,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch messages, optionally only those at or after `since`.
    async fn fetch(&self, since: Option<i64>) -> Result<FetchPage, StoreError>;

    /// Tell the store a message has been read.
    async fn mark_read(&self, id: &str) -> Result<(), StoreError>;
}
