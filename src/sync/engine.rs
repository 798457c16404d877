//! The synchronization engine: Deduplicator -> Thread Grouper -> Reconciler.
//!
//! `SyncEngine` is a plain synchronous value with a single owner. Poll
//! batches, push events and user actions all enter through its methods, so
//! every mutation of the thread map and read cache happens in one place and
//! in one order. Nothing here touches the network or disk; callers hand the
//! results (mark-read requests, ids to persist) to the I/O layer.

use std::collections::{HashSet, VecDeque};

use crate::config::Config;
use crate::message::dedup::Deduplicator;
use crate::message::thread::{Thread, ThreadBook, ThreadKey};
use crate::message::types::{
    CanonicalMessage, Direction, MessageId, RawMessage, Source, is_provisional_id,
};
use crate::view::projector::{self, InboxSnapshot, ThreadSummary};

use super::events::InboundEvent;
use super::read_state::{ReadState, ReadTrigger, Reconciler};

/// What a single engine call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub touched: Vec<ThreadKey>,
    /// Received messages that entered the working set for the first time
    pub new_received: Vec<MessageId>,
    /// Ids the store should be told are read
    pub mark_read: Vec<MessageId>,
    pub removed: usize,
    pub duplicates: usize,
    pub dropped: usize,
    /// Input referring to deleted messages
    pub ignored: usize,
}

impl ApplyReport {
    pub fn changed(&self) -> bool {
        !self.touched.is_empty() || self.removed > 0
    }
}

/// Deleted ids. Once full, the oldest entries are dropped first.
struct Tombstones {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns the ids pushed out to make room.
    fn insert(&mut self, id: MessageId) -> Vec<MessageId> {
        if !self.ids.insert(id.clone()) {
            return Vec::new();
        }
        self.order.push_back(id);

        let mut expired = Vec::new();
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
                expired.push(old);
            }
        }
        expired
    }
}

pub struct SyncEngine {
    dedup: Deduplicator,
    book: ThreadBook,
    reconciler: Reconciler,
    tombstones: Tombstones,
    /// Deleted records still held by the duplicate index, with their timestamp
    awaiting_forget: Vec<(MessageId, i64)>,
    /// Highest timestamp seen from the store, seeds the next delta poll
    cursor: Option<i64>,
    max_threads: usize,
    preview_length: usize,
    retention_secs: i64,
    cross_source_window_secs: i64,
}

impl SyncEngine {
    pub fn new(config: &Config) -> Self {
        Self::with_read_cache(config, Vec::new(), None)
    }

    /// Start from the persisted read ids and sync cursor.
    pub fn with_read_cache(
        config: &Config,
        read_ids: impl IntoIterator<Item = MessageId>,
        cursor: Option<i64>,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(config.dedup.clone()),
            book: ThreadBook::new(config.threads.preview_tie_break),
            reconciler: Reconciler::with_cached(read_ids),
            tombstones: Tombstones::new(config.threads.max_tombstones),
            awaiting_forget: Vec::new(),
            cursor,
            max_threads: config.threads.max_threads.max(1),
            preview_length: config.threads.preview_length,
            retention_secs: config.notifications.retention_secs(),
            cross_source_window_secs: config.dedup.cross_source_window_secs,
        }
    }

    /// Feed a batch of raw messages from a poll (snapshot or delta) or a
    /// push. Malformed rows are dropped, duplicates collapse, deleted
    /// messages stay deleted.
    pub fn ingest(&mut self, batch: Vec<RawMessage>) -> ApplyReport {
        let mut report = ApplyReport::default();

        let polled_max = batch
            .iter()
            .filter(|raw| raw.source == Source::Poll)
            .filter_map(|raw| raw.timestamp)
            .max();
        if let Some(ts) = polled_max {
            self.cursor = Some(self.cursor.map_or(ts, |c| c.max(ts)));
        }

        let batch: Vec<RawMessage> = batch
            .into_iter()
            .filter(|raw| match raw.id.as_deref() {
                Some(id) if self.tombstones.contains(id) => {
                    report.ignored += 1;
                    false
                }
                _ => true,
            })
            .collect();

        let ingested = self.dedup.ingest(batch);
        report.duplicates = ingested.duplicates;
        report.dropped = ingested.dropped;

        // Provisional copies already reported as new when they arrived
        let mut carried: HashSet<MessageId> = HashSet::new();
        for moved in &ingested.superseded {
            if let Some((key, _)) = self.book.remove_message(&moved.old_id) {
                report.touched.push(key);
                carried.insert(moved.new_id.clone());
            }
            if self.tombstones.contains(&moved.old_id) {
                self.tombstone(moved.new_id.clone());
            }
            self.reconciler.carry_over(&moved.old_id, &moved.new_id);
            if self.reconciler.is_optimistic(&moved.new_id) {
                report.mark_read.push(moved.new_id.clone());
            }
        }

        let mut accepted: Vec<CanonicalMessage> = Vec::with_capacity(ingested.canonical.len());
        for message in ingested.canonical {
            if self.tombstones.contains(&message.id) {
                tracing::debug!("Ignoring message {}: deleted", message.id);
                report.ignored += 1;
                continue;
            }
            if message.server_read {
                self.reconciler
                    .commit(&message.id, ReadTrigger::ServerSnapshot);
            }
            if message.direction == Direction::Received
                && !carried.contains(&message.id)
                && self.book.message(&message.id).is_none()
            {
                report.new_received.push(message.id.clone());
            }
            accepted.push(message);
        }

        for key in self.book.group(accepted) {
            if !report.touched.contains(&key) {
                report.touched.push(key);
            }
        }

        let evicted = self.book.evict_beyond(self.max_threads);
        if !evicted.is_empty() {
            report.new_received.retain(|id| !evicted.contains(id));
            self.dedup.forget(&evicted);
        }
        self.release_deleted();

        report
    }

    /// Apply one real-time event.
    pub fn apply_event(&mut self, event: InboundEvent) -> ApplyReport {
        tracing::debug!("Applying {} event", event.kind());
        match event {
            InboundEvent::MessageRead { message_id } => self.acknowledge_read(&message_id),
            InboundEvent::MessagesDeleted { ids } => self.messages_deleted(&ids),
            received => match received.into_raw() {
                Some(raw) => self.ingest(vec![raw]),
                None => ApplyReport::default(),
            },
        }
    }

    /// `message_read` push: direct unread -> read transition.
    ///
    /// Acks for ids not seen yet are still recorded so the message arrives
    /// already read. Acks for deleted messages are dropped.
    pub fn acknowledge_read(&mut self, id: &str) -> ApplyReport {
        let mut report = ApplyReport::default();
        let canonical = self.dedup.resolve(id).cloned().unwrap_or_else(|| id.to_string());

        if self.tombstones.contains(id) || self.tombstones.contains(&canonical) {
            tracing::debug!("Ignoring read ack for deleted message {}", id);
            report.ignored += 1;
            return report;
        }

        if self.reconciler.commit(&canonical, ReadTrigger::PushAck)
            && let Some(key) = self.book.thread_of(&canonical)
        {
            report.touched.push(key.clone());
        }
        report
    }

    /// User opened a thread: every unread member becomes read optimistically.
    /// Returns the ids the store should be told about.
    pub fn open_thread(&mut self, key: &ThreadKey) -> ApplyReport {
        let mut report = ApplyReport::default();
        let Some(thread) = self.book.get(key) else {
            return report;
        };

        let mut changed = false;
        for id in thread.unread_ids(&self.reconciler) {
            if self.reconciler.mark_optimistic(&id) {
                changed = true;
                // Provisional ids are sent once the store row supersedes them
                if !is_provisional_id(&id) {
                    report.mark_read.push(id);
                }
            }
        }
        if changed {
            report.touched.push(key.clone());
        }
        report.mark_read.sort();
        report
    }

    /// The store accepted a mark-read command.
    pub fn mark_read_confirmed(&mut self, id: &str) {
        self.reconciler.commit(id, ReadTrigger::StoreConfirmed);
    }

    /// The store no longer knows this message: drop it locally.
    pub fn purge(&mut self, id: &str) -> ApplyReport {
        tracing::debug!("Purging stale message {}", id);
        self.messages_deleted(&[id.to_string()])
    }

    /// Remove messages everywhere and remember them so stray events cannot
    /// bring them back.
    pub fn messages_deleted(&mut self, ids: &[MessageId]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for id in ids {
            let canonical = self.dedup.resolve(id).cloned().unwrap_or_else(|| id.clone());
            if let Some(message) = self.dedup.get(&canonical)
                && !self.awaiting_forget.iter().any(|(held, _)| *held == canonical)
            {
                self.awaiting_forget.push((canonical.clone(), message.timestamp));
            }

            // Aliases would otherwise come back once the index forgets them
            for alias in self.dedup.aliases_of(&canonical) {
                self.tombstone(alias);
            }
            self.tombstone(id.clone());
            self.tombstone(canonical.clone());

            if let Some((key, _)) = self.book.remove_message(&canonical) {
                report.removed += 1;
                if !report.touched.contains(&key) {
                    report.touched.push(key);
                }
            }
        }
        self.release_deleted();
        report
    }

    fn tombstone(&mut self, id: MessageId) {
        let expired = self.tombstones.insert(id);
        if !expired.is_empty() {
            self.awaiting_forget.retain(|(held, _)| !expired.contains(held));
            self.dedup.forget(&expired);
        }
    }

    /// Drop deleted records from the duplicate index once polling has moved
    /// past their cross-source window. Their tombstones still block the ids.
    fn release_deleted(&mut self) {
        let Some(cursor) = self.cursor else {
            return;
        };
        let horizon = cursor.saturating_sub(self.cross_source_window_secs);
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.awaiting_forget)
            .into_iter()
            .partition(|(_, ts)| *ts < horizon);
        self.awaiting_forget = kept;

        if !expired.is_empty() {
            let ids: Vec<MessageId> = expired.into_iter().map(|(id, _)| id).collect();
            tracing::debug!("Releasing {} deleted records from the duplicate index", ids.len());
            self.dedup.forget(&ids);
        }
    }

    /// Optimistic marks the store has not confirmed yet.
    pub fn unconfirmed_reads(&self) -> Vec<MessageId> {
        self.reconciler
            .optimistic_ids()
            .into_iter()
            .filter(|id| !is_provisional_id(id) && !self.tombstones.contains(id))
            .collect()
    }

    /// Of `ids`, the messages still present, unread and inside the
    /// notification retention window. Newest first.
    pub fn fresh_unread(&self, ids: &[MessageId], now: i64) -> Vec<&CanonicalMessage> {
        let cutoff = now.saturating_sub(self.retention_secs);
        let mut fresh: Vec<&CanonicalMessage> = ids
            .iter()
            .filter_map(|id| self.message(id))
            .filter(|m| m.timestamp >= cutoff)
            .filter(|m| self.reconciler.state(m) == ReadState::Unread)
            .collect();
        fresh.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        fresh.dedup_by(|a, b| a.id == b.id);
        fresh
    }

    pub fn take_pending_persist(&mut self) -> Vec<MessageId> {
        self.reconciler.take_pending()
    }

    pub fn persist_failed(&mut self, ids: Vec<MessageId>) {
        tracing::warn!("Read cache write failed for {} ids, will retry", ids.len());
        self.reconciler.persist_failed(ids);
    }

    pub fn has_pending_persist(&self) -> bool {
        self.reconciler.has_pending()
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// `since` for the next delta poll. Steps back by the cross-source window
    /// so rows the store unified late are fetched again; ingest absorbs the
    /// overlap.
    pub fn poll_since(&self) -> Option<i64> {
        self.cursor
            .map(|c| c.saturating_sub(self.cross_source_window_secs))
    }

    pub fn read_state(&self, id: &str) -> Option<ReadState> {
        let canonical = self.dedup.resolve(id)?;
        self.book
            .message(canonical)
            .map(|m| self.reconciler.state(m))
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn message(&self, id: &str) -> Option<&CanonicalMessage> {
        let canonical = self.dedup.resolve(id)?;
        self.book.message(canonical)
    }

    pub fn thread(&self, key: &ThreadKey) -> Option<&Thread> {
        self.book.get(key)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.book.threads()
    }

    pub fn unread_count(&self, key: &ThreadKey) -> usize {
        self.book
            .get(key)
            .map(|t| t.unread_count(&self.reconciler))
            .unwrap_or(0)
    }

    pub fn message_count(&self) -> usize {
        self.book.message_count()
    }

    pub fn project(&self) -> Vec<ThreadSummary> {
        projector::project(self.book.threads(), &self.reconciler, self.preview_length)
    }

    pub fn project_notifications(&self, now: i64) -> Vec<ThreadSummary> {
        projector::project_notifications(
            self.book.threads(),
            &self.reconciler,
            now,
            self.retention_secs,
            self.preview_length,
        )
    }

    pub fn snapshot(&self, now: i64, notice: Option<String>) -> InboxSnapshot {
        let threads = self.project();
        let total_unread = projector::total_unread(&threads);
        InboxSnapshot {
            generated_at: now,
            notifications: self.project_notifications(now),
            threads,
            total_unread,
            notice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::{Channel, Direction};

    fn engine() -> SyncEngine {
        SyncEngine::new(&Config::default())
    }

    fn polled(id: &str, lead: &str, body: &str, ts: i64) -> RawMessage {
        RawMessage {
            id: Some(id.to_string()),
            lead_id: Some(lead.to_string()),
            channel: Channel::Sms,
            direction: Direction::Received,
            subject: None,
            body: body.to_string(),
            timestamp: Some(ts),
            server_read_flag: false,
            attachments: Vec::new(),
            source: Source::Poll,
        }
    }

    fn pushed(id: Option<&str>, lead: &str, body: &str, ts: i64) -> InboundEvent {
        InboundEvent::MessageReceived {
            message_id: id.map(|s| s.to_string()),
            lead_id: Some(lead.to_string()),
            channel: Channel::Sms,
            direction: Direction::Received,
            subject: None,
            body: body.to_string(),
            timestamp: Some(ts),
            attachments: Vec::new(),
        }
    }

    fn email(id: &str, lead: &str, subject: &str, ts: i64) -> RawMessage {
        RawMessage {
            channel: Channel::Email,
            subject: Some(subject.to_string()),
            ..polled(id, lead, "email body", ts)
        }
    }

    /// Every thread's unread count equals its unread members, counted directly.
    fn assert_unread_consistent(engine: &SyncEngine) {
        for thread in engine.threads() {
            let direct = thread
                .messages()
                .iter()
                .filter(|m| engine.read_state(&m.id) == Some(ReadState::Unread))
                .count();
            assert_eq!(engine.unread_count(&thread.key), direct, "thread {}", thread.key);
        }
    }

    #[test]
    fn test_repeated_poll_is_idempotent() {
        let mut engine = engine();
        let batch = vec![polled("m1", "L1", "hi", 100), polled("m2", "L2", "hey", 200)];

        engine.ingest(batch.clone());
        let first = engine.project();
        let report = engine.ingest(batch);

        assert_eq!(engine.project(), first);
        assert_eq!(engine.message_count(), 2);
        assert!(report.new_received.is_empty());
        assert_unread_consistent(&engine);
    }

    #[test]
    fn test_push_then_poll_yields_one_message() {
        let mut engine = engine();
        engine.apply_event(pushed(None, "L42", "See you at 3pm", 1000));
        engine.ingest(vec![polled("row-7", "L42", "See you at 3pm", 1008)]);

        assert_eq!(engine.message_count(), 1);
        let thread = engine.thread(&"sms:L42".into()).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread.last_message().unwrap().id, "row-7");
        assert_unread_consistent(&engine);
    }

    #[test]
    fn test_superseded_push_is_new_only_once() {
        let mut engine = engine();
        let push = engine.apply_event(pushed(None, "L42", "See you at 3pm", 1000));
        let poll = engine.ingest(vec![polled("row-7", "L42", "See you at 3pm", 1008)]);

        assert_eq!(push.new_received.len(), 1);
        assert!(poll.new_received.is_empty());
        assert_eq!(poll.touched, vec![ThreadKey::from("sms:L42")]);
    }

    #[test]
    fn test_poll_then_push_yields_one_message() {
        let mut engine = engine();
        engine.ingest(vec![polled("row-7", "L42", "See you at 3pm", 1008)]);
        let report = engine.apply_event(pushed(None, "L42", "See you at 3pm", 1000));

        assert_eq!(engine.message_count(), 1);
        assert_eq!(report.duplicates, 1);
        assert!(report.new_received.is_empty());
    }

    #[test]
    fn test_read_is_monotonic_against_stale_snapshot() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "hi", 100)]);
        engine.apply_event(InboundEvent::MessageRead {
            message_id: "m1".to_string(),
        });
        assert_eq!(engine.read_state("m1"), Some(ReadState::Read));

        // Stale snapshot still says unread
        engine.ingest(vec![polled("m1", "L1", "hi", 100)]);

        assert_eq!(engine.read_state("m1"), Some(ReadState::Read));
        assert_eq!(engine.unread_count(&"sms:L1".into()), 0);
        assert_unread_consistent(&engine);
    }

    #[test]
    fn test_server_read_flag_is_committed() {
        let mut engine = engine();
        let mut row = polled("m1", "L1", "hi", 100);
        row.server_read_flag = true;
        engine.ingest(vec![row]);

        assert_eq!(engine.take_pending_persist(), vec!["m1".to_string()]);
        assert_eq!(engine.read_state("m1"), Some(ReadState::Read));
    }

    #[test]
    fn test_delete_then_stray_ack_is_noop() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "hi", 100)]);
        let deleted = engine.messages_deleted(&["m1".to_string()]);
        assert_eq!(deleted.removed, 1);

        let ack = engine.apply_event(InboundEvent::MessageRead {
            message_id: "m1".to_string(),
        });

        assert_eq!(ack.ignored, 1);
        assert!(!ack.changed());
        assert!(engine.message("m1").is_none());
        assert!(engine.project().is_empty());
        assert!(!engine.has_pending_persist());
    }

    #[test]
    fn test_deleted_message_is_not_reinserted() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "hi there", 100)]);
        engine.messages_deleted(&["m1".to_string()]);

        // Poll repeat and a push duplicate without id
        let again = engine.ingest(vec![polled("m1", "L1", "hi there", 100)]);
        engine.apply_event(pushed(None, "L1", "hi there", 105));

        assert_eq!(again.ignored, 1);
        assert_eq!(engine.message_count(), 0);
        assert!(engine.is_deleted("m1"));
    }

    #[test]
    fn test_tombstones_are_capped() {
        let mut config = Config::default();
        config.threads.max_tombstones = 2;
        let mut engine = SyncEngine::new(&config);
        engine.ingest(vec![
            polled("a", "L1", "a", 100),
            polled("b", "L2", "b", 200),
            polled("c", "L3", "c", 300),
        ]);

        engine.messages_deleted(&["a".to_string(), "b".to_string(), "c".to_string()]);

        assert_eq!(engine.tombstone_count(), 2);
        assert!(!engine.is_deleted("a"));
        assert!(engine.is_deleted("b"));
        assert!(engine.is_deleted("c"));
        assert!(engine.dedup.resolve("a").is_none());
        assert_eq!(engine.message_count(), 0);
    }

    #[test]
    fn test_deleted_records_leave_duplicate_index() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "hi", 1_000)]);
        engine.messages_deleted(&["m1".to_string()]);
        // Still indexed so a late push copy collapses onto the deleted record
        assert_eq!(engine.dedup.len(), 1);

        engine.ingest(vec![polled("m2", "L2", "later", 1_500)]);
        assert_eq!(engine.dedup.len(), 1);
        assert!(engine.dedup.resolve("m1").is_none());

        let again = engine.ingest(vec![polled("m1", "L1", "hi", 1_000)]);
        assert_eq!(again.ignored, 1);
        assert!(engine.message("m1").is_none());
    }

    #[test]
    fn test_deleting_superseded_message_blocks_provisional_id() {
        let mut engine = engine();
        let push = engine.apply_event(pushed(None, "L1", "call me", 1000));
        let provisional = push.new_received[0].clone();
        engine.ingest(vec![polled("row-1", "L1", "call me", 1010)]);

        engine.messages_deleted(&["row-1".to_string()]);

        assert!(engine.is_deleted(&provisional));
        assert!(engine.is_deleted("row-1"));
    }

    #[test]
    fn test_out_of_order_push_keeps_preview() {
        let mut engine = engine();
        engine.ingest(vec![polled("m500", "L1", "latest", 500)]);
        engine.apply_event(pushed(Some("m480"), "L1", "earlier", 480));

        let summaries = engine.project();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].last_message_id, "m500");
        assert_eq!(summaries[0].last_timestamp, 500);
        assert_eq!(summaries[0].message_count, 2);
    }

    #[test]
    fn test_retention_window() {
        let now = 1_000 * 86_400;
        let mut engine = engine();
        engine.ingest(vec![polled("old", "L1", "ten days", now - 10 * 86_400)]);

        let snapshot = engine.snapshot(now, None);
        assert_eq!(snapshot.threads.len(), 1);
        assert!(snapshot.notifications.is_empty());
    }

    #[test]
    fn test_open_thread_marks_optimistically() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "a", 100), polled("m2", "L1", "b", 200)]);
        let key: ThreadKey = "sms:L1".into();

        let report = engine.open_thread(&key);

        assert_eq!(report.mark_read, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(engine.unread_count(&key), 0);
        assert_eq!(engine.unconfirmed_reads().len(), 2);
        assert_unread_consistent(&engine);

        // Reopening asks for nothing new
        assert!(engine.open_thread(&key).mark_read.is_empty());

        engine.mark_read_confirmed("m1");
        assert_eq!(engine.unconfirmed_reads(), vec!["m2".to_string()]);
        assert_eq!(engine.take_pending_persist(), vec!["m1".to_string()]);
    }

    #[test]
    fn test_purge_on_not_found() {
        let mut engine = engine();
        engine.ingest(vec![polled("m1", "L1", "a", 100), polled("m2", "L1", "b", 200)]);

        let report = engine.purge("m2");

        assert_eq!(report.removed, 1);
        let summaries = engine.project();
        assert_eq!(summaries[0].last_message_id, "m1");
        assert_eq!(summaries[0].unread_count, 1);
    }

    #[test]
    fn test_ack_before_message_arrives() {
        let mut engine = engine();
        engine.acknowledge_read("m1");
        engine.ingest(vec![polled("m1", "L1", "late row", 100)]);

        assert_eq!(engine.read_state("m1"), Some(ReadState::Read));
    }

    #[test]
    fn test_optimistic_read_survives_supersede() {
        let mut engine = engine();
        engine.apply_event(pushed(None, "L1", "call me", 1000));
        let key: ThreadKey = "sms:L1".into();

        // Provisional ids cannot be marked on the store yet
        let opened = engine.open_thread(&key);
        assert!(opened.mark_read.is_empty());
        assert_eq!(engine.unread_count(&key), 0);

        let report = engine.ingest(vec![polled("row-1", "L1", "call me", 1010)]);

        assert_eq!(report.mark_read, vec!["row-1".to_string()]);
        assert_eq!(engine.read_state("row-1"), Some(ReadState::Read));
        assert_eq!(engine.unread_count(&key), 0);
    }

    #[test]
    fn test_malformed_rows_do_not_disturb() {
        let mut engine = engine();
        let mut bad = polled("x", "L1", "hi", 100);
        bad.lead_id = None;

        let report = engine.ingest(vec![bad, polled("ok", "L1", "hi", 100)]);

        assert_eq!(report.dropped, 1);
        assert_eq!(engine.message_count(), 1);
    }

    #[test]
    fn test_email_threads_by_subject() {
        let mut engine = engine();
        engine.ingest(vec![
            email("e1", "L1", "Booking Update", 100),
            email("e2", "L1", "Re: booking update", 200),
            email("e3", "L1", "Booking Update 2", 300),
        ]);

        assert_eq!(engine.threads().count(), 2);
        assert_eq!(
            engine.thread(&"email:L1:booking update".into()).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_cursor_tracks_polls_only() {
        let mut engine = engine();
        engine.apply_event(pushed(Some("p1"), "L1", "push", 9_000));
        assert_eq!(engine.cursor(), None);

        engine.ingest(vec![polled("m1", "L1", "a", 1_000), polled("m2", "L1", "b", 2_000)]);
        assert_eq!(engine.cursor(), Some(2_000));
        assert_eq!(engine.poll_since(), Some(2_000 - 120));

        engine.ingest(vec![polled("m0", "L1", "c", 500)]);
        assert_eq!(engine.cursor(), Some(2_000));
    }

    #[test]
    fn test_working_set_is_capped() {
        let mut config = Config::default();
        config.threads.max_threads = 2;
        let mut engine = SyncEngine::new(&config);

        engine.ingest(vec![
            polled("a", "L1", "a", 100),
            polled("b", "L2", "b", 200),
            polled("c", "L3", "c", 300),
        ]);

        assert_eq!(engine.threads().count(), 2);
        assert!(engine.message("a").is_none());
    }

    #[test]
    fn test_restored_read_cache() {
        let mut engine =
            SyncEngine::with_read_cache(&Config::default(), vec!["m1".to_string()], Some(50));
        engine.ingest(vec![polled("m1", "L1", "a", 100), polled("m2", "L1", "b", 200)]);

        assert_eq!(engine.unread_count(&"sms:L1".into()), 1);
        assert_eq!(engine.cursor(), Some(200));
    }

    #[test]
    fn test_fresh_unread_for_notifications() {
        let day = 86_400;
        let now = 30 * day;
        let mut engine = engine();
        let report = engine.ingest(vec![
            polled("old", "L1", "ten days ago", now - 10 * day),
            polled("new", "L2", "just now", now - 60),
            polled("seen", "L3", "already read", now - 30),
        ]);
        engine.acknowledge_read("seen");

        let fresh = engine.fresh_unread(&report.new_received, now);
        let ids: Vec<_> = fresh.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }
}
