use std::collections::HashMap;
use std::fmt;

use super::types::{CanonicalMessage, Channel, ChannelSet, Direction, LeadId, MessageId};
use crate::config::PreviewTieBreak;

/// Conversation identity: `sms:{lead}` or `email:{lead}:{normalized subject}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(String);

impl ThreadKey {
    pub fn for_message(message: &CanonicalMessage) -> Self {
        match message.channel {
            Channel::Sms => Self(format!("sms:{}", message.lead_id)),
            Channel::Email => Self(format!(
                "email:{}:{}",
                message.lead_id,
                normalize_subject(message.subject.as_deref().unwrap_or_default())
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answers whether a message currently counts as read.
pub trait ReadOracle {
    fn is_read(&self, message: &CanonicalMessage) -> bool;
}

impl<F> ReadOracle for F
where
    F: Fn(&CanonicalMessage) -> bool,
{
    fn is_read(&self, message: &CanonicalMessage) -> bool {
        self(message)
    }
}

/// One conversation with a lead.
///
/// Aggregates (preview, unread count, channels) are recomputed from
/// `messages`, never adjusted incrementally.
#[derive(Debug, Clone)]
pub struct Thread {
    pub key: ThreadKey,
    pub lead_id: LeadId,
    messages: HashMap<MessageId, CanonicalMessage>,
    last_message_id: Option<MessageId>,
    channels: ChannelSet,
}

impl Thread {
    pub fn new(key: ThreadKey, lead_id: LeadId) -> Self {
        Self {
            key,
            lead_id,
            messages: HashMap::new(),
            last_message_id: None,
            channels: ChannelSet::empty(),
        }
    }

    /// Insert a message or replace the member with the same id.
    pub fn upsert(&mut self, message: CanonicalMessage, tie_break: PreviewTieBreak) {
        self.messages.insert(message.id.clone(), message);
        self.refresh(tie_break);
    }

    pub fn remove(&mut self, id: &str, tie_break: PreviewTieBreak) -> Option<CanonicalMessage> {
        let removed = self.messages.remove(id);
        if removed.is_some() {
            self.refresh(tie_break);
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalMessage> {
        self.messages.get(id)
    }

    /// Max-timestamp member, regardless of insertion order.
    pub fn last_message(&self) -> Option<&CanonicalMessage> {
        self.last_message_id
            .as_ref()
            .and_then(|id| self.messages.get(id))
    }

    pub fn unread_count(&self, read: &impl ReadOracle) -> usize {
        self.messages.values().filter(|m| !read.is_read(m)).count()
    }

    pub fn unread_ids(&self, read: &impl ReadOracle) -> Vec<MessageId> {
        self.messages
            .values()
            .filter(|m| !read.is_read(m))
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn has_attachments(&self) -> bool {
        self.messages.values().any(|m| m.has_attachments())
    }

    /// Members sorted by timestamp ascending.
    pub fn messages(&self) -> Vec<&CanonicalMessage> {
        let mut sorted: Vec<_> = self.messages.values().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        sorted
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.messages.keys()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn refresh(&mut self, tie_break: PreviewTieBreak) {
        self.last_message_id = self
            .messages
            .values()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| preview_rank(a, tie_break).cmp(&preview_rank(b, tie_break)))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|m| m.id.clone());

        self.channels = self
            .messages
            .values()
            .fold(ChannelSet::empty(), |set, m| set | m.channel.into());
    }
}

fn preview_rank(message: &CanonicalMessage, tie_break: PreviewTieBreak) -> u8 {
    match (tie_break, message.direction) {
        (PreviewTieBreak::Sent, Direction::Sent) => 1,
        (PreviewTieBreak::Received, Direction::Received) => 1,
        _ => 0,
    }
}

/// All threads in the working set plus a message id → thread index.
#[derive(Debug, Default)]
pub struct ThreadBook {
    threads: HashMap<ThreadKey, Thread>,
    by_message: HashMap<MessageId, ThreadKey>,
    tie_break: PreviewTieBreak,
}

impl ThreadBook {
    pub fn new(tie_break: PreviewTieBreak) -> Self {
        Self {
            threads: HashMap::new(),
            by_message: HashMap::new(),
            tie_break,
        }
    }

    /// Place canonical messages into their threads, creating threads on
    /// first sight. Returns the keys of every thread touched.
    pub fn group(&mut self, canonical: Vec<CanonicalMessage>) -> Vec<ThreadKey> {
        let mut touched: Vec<ThreadKey> = Vec::new();

        for message in canonical {
            let key = ThreadKey::for_message(&message);

            // Subject is immutable, but guard against a store edit moving a row
            if let Some(previous) = self.by_message.get(&message.id)
                && *previous != key
                && let Some(old_thread) = self.threads.get_mut(previous)
            {
                old_thread.remove(&message.id, self.tie_break);
            }

            self.by_message.insert(message.id.clone(), key.clone());
            self.threads
                .entry(key.clone())
                .or_insert_with(|| Thread::new(key.clone(), message.lead_id.clone()))
                .upsert(message, self.tie_break);

            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        touched
    }

    /// Remove a message from whichever thread holds it.
    pub fn remove_message(&mut self, id: &str) -> Option<(ThreadKey, CanonicalMessage)> {
        let key = self.by_message.remove(id)?;
        let removed = self.threads.get_mut(&key)?.remove(id, self.tie_break)?;
        Some((key, removed))
    }

    pub fn get(&self, key: &ThreadKey) -> Option<&Thread> {
        self.threads.get(key)
    }

    pub fn thread_of(&self, id: &str) -> Option<&ThreadKey> {
        self.by_message.get(id)
    }

    pub fn message(&self, id: &str) -> Option<&CanonicalMessage> {
        let key = self.by_message.get(id)?;
        self.threads.get(key)?.get(id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.by_message.len()
    }

    /// Keep only the `max_threads` most recently active threads. Returns the
    /// ids of every message that left the working set.
    pub fn evict_beyond(&mut self, max_threads: usize) -> Vec<MessageId> {
        if self.threads.len() <= max_threads {
            return Vec::new();
        }

        let mut by_activity: Vec<(i64, ThreadKey)> = self
            .threads
            .values()
            .map(|t| {
                let latest = t.last_message().map(|m| m.timestamp).unwrap_or(i64::MIN);
                (latest, t.key.clone())
            })
            .collect();
        by_activity.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut evicted = Vec::new();
        for (_, key) in by_activity.into_iter().skip(max_threads) {
            if let Some(thread) = self.threads.remove(&key) {
                tracing::debug!("Evicting thread {} ({} messages)", key, thread.len());
                for id in thread.message_ids() {
                    self.by_message.remove(id);
                    evicted.push(id.clone());
                }
            }
        }
        evicted
    }
}

/// Normalize subject for grouping: strip Re:/Fwd:/Fw: prefixes and lowercase
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        if lower.starts_with("re:") {
            s = s[3..].trim_start();
        } else if lower.starts_with("fwd:") {
            s = s[4..].trim_start();
        } else if lower.starts_with("fw:") {
            s = s[3..].trim_start();
        } else {
            break;
        }
    }
    s.trim_end().to_lowercase()
}
