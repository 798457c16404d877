//! Read-state reconciliation.
//!
//! Three opinions feed the read flag of a message: the store's flag, the
//! local read cache and an optimistic mark recorded when the user opens a
//! thread. Any one of them saying "read" wins, and nothing in a session
//! ever removes an id from the cache, so the flag can only go from unread
//! to read.

use std::collections::HashSet;

use crate::message::thread::ReadOracle;
use crate::message::types::{CanonicalMessage, MessageId};

/// Merge the three read opinions into one flag.
#[inline]
pub fn resolve(server_flag: bool, in_local_cache: bool, optimistic_intent: bool) -> bool {
    server_flag || in_local_cache || optimistic_intent
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Unread,
    /// Terminal
    Read,
}

impl From<bool> for ReadState {
    fn from(is_read: bool) -> Self {
        if is_read { ReadState::Read } else { ReadState::Unread }
    }
}

/// What caused an unread -> read transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTrigger {
    ServerSnapshot,
    PushAck,
    UserOpened,
    StoreConfirmed,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    /// Local cache membership: restored ids plus everything committed this session
    cached: HashSet<MessageId>,
    /// Marked read by the user, not yet confirmed by the store
    optimistic: HashSet<MessageId>,
    /// Committed ids that still need to reach durable storage, oldest first
    pending: Vec<MessageId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the persisted cache at startup.
    pub fn with_cached(ids: impl IntoIterator<Item = MessageId>) -> Self {
        Self {
            cached: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn state(&self, message: &CanonicalMessage) -> ReadState {
        self.is_read(message).into()
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cached.contains(id)
    }

    pub fn is_optimistic(&self, id: &str) -> bool {
        self.optimistic.contains(id)
    }

    /// Add an id to the local cache. Idempotent; returns true the first time.
    pub fn commit(&mut self, id: &str, trigger: ReadTrigger) -> bool {
        self.optimistic.remove(id);
        if !self.cached.insert(id.to_string()) {
            return false;
        }
        tracing::debug!("Message {} read ({:?})", id, trigger);
        self.pending.push(id.to_string());
        true
    }

    /// Record user intent to read a message before the store confirms it.
    /// Returns true if this is new information.
    pub fn mark_optimistic(&mut self, id: &str) -> bool {
        if self.cached.contains(id) {
            return false;
        }
        self.optimistic.insert(id.to_string())
    }

    /// A provisional id was replaced: the new id inherits any read opinion.
    pub fn carry_over(&mut self, old_id: &str, new_id: &str) {
        if self.cached.contains(old_id) {
            self.commit(new_id, ReadTrigger::StoreConfirmed);
        } else if self.optimistic.remove(old_id) {
            self.optimistic.insert(new_id.to_string());
        }
    }

    /// Ids awaiting store confirmation, for retrying mark-read commands.
    pub fn optimistic_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.optimistic.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Hand the persistence queue to the writer.
    pub fn take_pending(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.pending)
    }

    /// Durable write failed: queue the ids again ahead of newer ones.
    /// In-memory state is unaffected.
    pub fn persist_failed(&mut self, mut ids: Vec<MessageId>) {
        ids.retain(|id| !self.pending.contains(id));
        ids.append(&mut self.pending);
        self.pending = ids;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl ReadOracle for Reconciler {
    fn is_read(&self, message: &CanonicalMessage) -> bool {
        resolve(
            message.server_read,
            self.cached.contains(&message.id),
            self.optimistic.contains(&message.id),
        )
    }
}
