//! Scripted store double for actor tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use super::{FetchPage, MessageStore, StoreError};
use crate::message::types::RawMessage;

#[derive(Default)]
pub struct MemoryStore {
    /// Queued fetch results, consumed in order; empty pages once exhausted
    pages: Mutex<VecDeque<Result<Vec<RawMessage>, String>>>,
    missing: Mutex<HashSet<String>>,
    pub fetch_calls: Mutex<Vec<Option<i64>>>,
    pub marked: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, messages: Vec<RawMessage>) {
        self.pages.lock().unwrap().push_back(Ok(messages));
    }

    pub fn push_failure(&self, error: &str) {
        self.pages.lock().unwrap().push_back(Err(error.to_string()));
    }

    pub fn set_missing(&self, id: &str) {
        self.missing.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn fetch(&self, since: Option<i64>) -> Result<FetchPage, StoreError> {
        self.fetch_calls.lock().unwrap().push(since);
        match self.pages.lock().unwrap().pop_front() {
            Some(Ok(messages)) => Ok(FetchPage {
                messages,
                dropped: 0,
            }),
            Some(Err(e)) => Err(StoreError::Transient(e)),
            None => Ok(FetchPage::default()),
        }
    }

    async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        if self.missing.lock().unwrap().contains(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.marked.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
