//! Sync actor: owns the `SyncEngine` and does all of its I/O.
//!
//! Commands arrive over an mpsc channel and are applied one at a time, so
//! the engine has exactly one writer. Store calls and read-cache writes run
//! as spawned tasks and report back through a second channel.
//! Every change publishes a fresh `InboxSnapshot` on a watch channel.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::actor::{RetryConfig, with_retry, with_retry_if};
use crate::cache::{ReadCacheStore, SyncState};
use crate::config::Config;
use crate::constants::{ACTOR_COMMAND_CAPACITY, SYNC_STATE_KEY};
use crate::message::thread::ThreadKey;
use crate::message::types::MessageId;
use crate::store::{FetchPage, MessageStore, StoreError};
use crate::view::projector::InboxSnapshot;

use super::engine::{ApplyReport, SyncEngine};
use super::events::InboundEvent;

const STORE_UNREACHABLE_NOTICE: &str = "Message store unreachable, retrying";

#[derive(Debug)]
pub enum SyncCommand {
    /// Poll the store now, unless the last poll was too recent
    PollNow,
    /// One decoded real-time event
    Event(InboundEvent),
    /// The user opened a thread
    OpenThread(ThreadKey),
    Shutdown,
}

/// Results of spawned work, fed back into the actor loop.
#[derive(Debug)]
enum Completion {
    MarkRead {
        id: MessageId,
        result: Result<(), StoreError>,
    },
    Persisted {
        ids: Vec<MessageId>,
        ok: bool,
    },
    Polled {
        result: Result<FetchPage, StoreError>,
    },
}

/// Handle for talking to the sync actor.
#[derive(Clone)]
pub struct SyncActorHandle {
    pub cmd_tx: mpsc::Sender<SyncCommand>,
    pub snapshot_rx: watch::Receiver<InboxSnapshot>,
}

impl SyncActorHandle {
    pub async fn send(&self, cmd: SyncCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("sync actor has stopped"))
    }

    /// Latest published inbox view.
    pub fn snapshot(&self) -> InboxSnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

/// Build the engine from the persisted read ids and cursor. A cache that
/// cannot be read means starting empty, not failing.
pub async fn load_engine(config: &Config, cache: &dyn ReadCacheStore) -> SyncEngine {
    let read_ids = cache.load_read_ids().await.unwrap_or_else(|e| {
        tracing::warn!("Failed to load read cache: {:#}", e);
        Vec::new()
    });
    let state = cache
        .load_sync_state(SYNC_STATE_KEY)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to load sync state: {:#}", e);
            SyncState::default()
        });

    tracing::info!(
        "Restored {} read ids, cursor {:?}",
        read_ids.len(),
        state.cursor
    );
    SyncEngine::with_read_cache(config, read_ids, state.cursor)
}

/// Spawn the sync actor. The first poll runs immediately.
pub fn spawn_sync_actor(
    engine: SyncEngine,
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn ReadCacheStore>,
    config: Config,
) -> (SyncActorHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(ACTOR_COMMAND_CAPACITY);
    let (done_tx, done_rx) = mpsc::channel(ACTOR_COMMAND_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot(now(), None));

    let actor = SyncActor {
        engine,
        store,
        cache,
        retry: RetryConfig::from(&config.cache),
        config,
        snapshot_tx,
        done_tx,
        notice: None,
        last_poll: None,
        initial_sync_done: false,
        polling: false,
        poll_queued: false,
        in_flight: HashSet::new(),
        persisting: false,
        dirty: false,
    };
    let task = tokio::spawn(actor.run(cmd_rx, done_rx));

    (SyncActorHandle { cmd_tx, snapshot_rx }, task)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

struct SyncActor {
    engine: SyncEngine,
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn ReadCacheStore>,
    config: Config,
    retry: RetryConfig,
    snapshot_tx: watch::Sender<InboxSnapshot>,
    done_tx: mpsc::Sender<Completion>,
    notice: Option<String>,
    last_poll: Option<Instant>,
    initial_sync_done: bool,
    polling: bool,
    poll_queued: bool,
    /// Mark-read commands awaiting a store answer
    in_flight: HashSet<MessageId>,
    persisting: bool,
    /// Snapshot needs republishing
    dirty: bool,
}

impl SyncActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SyncCommand>,
        mut done_rx: mpsc::Receiver<Completion>,
    ) {
        let mut ticker = tokio::time::interval(self.config.store.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SyncCommand::Shutdown) => {
                        tracing::info!("Sync actor shutting down");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        tracing::info!("Command channel closed, shutting down");
                        break;
                    }
                },
                Some(done) = done_rx.recv() => self.handle_completion(done),
                _ = ticker.tick() => self.start_poll(),
            }
            self.publish();
        }

        self.flush().await;
    }

    fn handle_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::PollNow => {
                let min = self.config.store.min_poll_interval();
                if let Some(last) = self.last_poll
                    && last.elapsed() < min
                {
                    tracing::debug!("Poll request coalesced with the previous poll");
                    return;
                }
                self.start_poll();
            }
            SyncCommand::Event(event) => {
                let report = self.engine.apply_event(event);
                self.after_apply(report);
            }
            SyncCommand::OpenThread(key) => {
                let report = self.engine.open_thread(&key);
                self.after_apply(report);
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn start_poll(&mut self) {
        if self.polling {
            self.poll_queued = true;
            return;
        }
        self.polling = true;
        self.last_poll = Some(Instant::now());

        // The working set starts empty each session, so the stored cursor
        // only seeds deltas after a full snapshot has been applied
        let since = if self.initial_sync_done {
            self.engine.poll_since()
        } else {
            None
        };
        let store = Arc::clone(&self.store);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = store.fetch(since).await;
            if done_tx.send(Completion::Polled { result }).await.is_err() {
                tracing::debug!("Sync actor gone before poll completed");
            }
        });
    }

    fn finish_poll(&mut self, result: Result<FetchPage, StoreError>) {
        self.polling = false;
        self.apply_poll(result);

        // A request that arrived mid-poll may have missed newer rows
        if self.poll_queued {
            self.poll_queued = false;
            self.start_poll();
        }
    }

    fn apply_poll(&mut self, result: Result<FetchPage, StoreError>) {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("Poll failed: {}", e);
                if self.notice.is_none() {
                    self.notice = Some(STORE_UNREACHABLE_NOTICE.to_string());
                    self.dirty = true;
                }
                return;
            }
        };

        if self.notice.take().is_some() {
            self.dirty = true;
        }

        let mut report = self.engine.ingest(page.messages);
        report.dropped += page.dropped;
        tracing::debug!(
            "Poll ingested: {} threads touched, {} duplicates, {} dropped",
            report.touched.len(),
            report.duplicates,
            report.dropped
        );
        self.after_apply(report);
        self.initial_sync_done = true;

        // Store calls that failed earlier get another chance now it answers
        for id in self.engine.unconfirmed_reads() {
            self.dispatch_mark_read(id);
        }

        let cache = Arc::clone(&self.cache);
        let state = SyncState::new(self.engine.cursor(), now());
        tokio::spawn(async move {
            if let Err(e) = cache.save_sync_state(SYNC_STATE_KEY, &state).await {
                tracing::warn!("Failed to save sync state: {:#}", e);
            }
        });
    }

    fn after_apply(&mut self, report: ApplyReport) {
        if report.changed() {
            self.dirty = true;
        }
        for id in report.mark_read {
            self.dispatch_mark_read(id);
        }
        if self.initial_sync_done && !report.new_received.is_empty() {
            self.notify(&report.new_received);
        }
        self.schedule_persist();
    }

    #[cfg(feature = "notifications")]
    fn notify(&self, ids: &[MessageId]) {
        let fresh = self.engine.fresh_unread(ids, now());
        if !fresh.is_empty() {
            crate::notification::notify_new_messages(&self.config.notifications, &fresh);
        }
    }

    #[cfg(not(feature = "notifications"))]
    fn notify(&self, _ids: &[MessageId]) {}

    fn dispatch_mark_read(&mut self, id: MessageId) {
        if !self.in_flight.insert(id.clone()) {
            return;
        }

        let store = Arc::clone(&self.store);
        let done_tx = self.done_tx.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let result = with_retry_if(&retry, || store.mark_read(&id), |e| !e.is_not_found()).await;
            if done_tx.send(Completion::MarkRead { id, result }).await.is_err() {
                tracing::debug!("Sync actor gone before mark-read completed");
            }
        });
    }

    fn schedule_persist(&mut self) {
        if self.persisting || !self.engine.has_pending_persist() {
            return;
        }
        let ids = self.engine.take_pending_persist();
        self.persisting = true;

        let cache = Arc::clone(&self.cache);
        let done_tx = self.done_tx.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let read_at = now();
            let ok = with_retry(&retry, || cache.commit_read_ids(&ids, read_at))
                .await
                .is_ok();
            if done_tx.send(Completion::Persisted { ids, ok }).await.is_err() {
                tracing::debug!("Sync actor gone before persistence completed");
            }
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::MarkRead { id, result } => {
                self.in_flight.remove(&id);
                match result {
                    Ok(()) => {
                        self.engine.mark_read_confirmed(&id);
                        self.schedule_persist();
                    }
                    Err(StoreError::NotFound(_)) => {
                        let report = self.engine.purge(&id);
                        self.after_apply(report);
                    }
                    Err(e) => {
                        // Still read locally; resent after the next good poll
                        tracing::warn!("Mark-read for {} failed: {}", id, e);
                    }
                }
            }
            Completion::Polled { result } => self.finish_poll(result),
            Completion::Persisted { ids, ok } => {
                self.persisting = false;
                if ok {
                    tracing::debug!("Persisted {} read ids", ids.len());
                    self.schedule_persist();
                } else {
                    self.engine.persist_failed(ids);
                }
            }
        }
    }

    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.snapshot_tx
            .send_replace(self.engine.snapshot(now(), self.notice.clone()));
    }

    /// Write whatever is still pending before exiting.
    async fn flush(&mut self) {
        let ids = self.engine.take_pending_persist();
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.cache.commit_read_ids(&ids, now()).await {
            tracing::warn!("Failed to flush {} read ids on shutdown: {:#}", ids.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::message::types::{Channel, Direction, RawMessage, Source};
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.store.poll_interval_secs = 3600;
        config.store.min_poll_interval_secs = 0;
        config.cache.persist_retry_delay_ms = 1;
        config.notifications.enabled = false;
        config
    }

    fn row(id: &str, lead: &str, body: &str, ts: i64) -> RawMessage {
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

    async fn start(
        store: Arc<MemoryStore>,
        cache: Arc<Cache>,
    ) -> (SyncActorHandle, JoinHandle<()>) {
        let config = test_config();
        let engine = load_engine(&config, cache.as_ref()).await;
        spawn_sync_actor(engine, store, cache, config)
    }

    async fn wait_for(
        handle: &SyncActorHandle,
        predicate: impl FnMut(&InboxSnapshot) -> bool,
    ) -> InboxSnapshot {
        let mut rx = handle.snapshot_rx.clone();
        tokio::time::timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("actor stopped")
            .clone()
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check().await {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_poll_publishes_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.push_page(vec![row("m1", "L1", "hello", 1_000), row("m2", "L2", "hi", 2_000)]);
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());

        let (handle, _task) = start(store.clone(), cache.clone()).await;
        let snapshot = wait_for(&handle, |s| s.threads.len() == 2).await;

        assert_eq!(snapshot.total_unread, 2);
        assert_eq!(snapshot.threads[0].lead_id, "L2");
        assert_eq!(store.fetch_calls.lock().unwrap()[0], None);

        let cache_check = cache.clone();
        eventually(async || {
            cache_check.load_sync_state(SYNC_STATE_KEY).await.unwrap().cursor == Some(2_000)
        })
        .await;
    }

    #[tokio::test]
    async fn test_push_then_poll_collapses_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        let (handle, _task) = start(store.clone(), cache).await;

        let event = InboundEvent::parse(
            r#"{"type":"message_received","leadId":"L42","channel":"sms","body":"See you at 3pm","timestamp":1000}"#,
        )
        .unwrap();
        handle.send(SyncCommand::Event(event)).await.unwrap();
        wait_for(&handle, |s| s.threads.len() == 1).await;

        let store_check = store.clone();
        eventually(async || !store_check.fetch_calls.lock().unwrap().is_empty()).await;
        store.push_page(vec![row("store-7", "L42", "See you at 3pm", 1_008)]);
        handle.send(SyncCommand::PollNow).await.unwrap();

        let snapshot = wait_for(&handle, |s| {
            s.threads.first().map(|t| t.last_message_id.as_str()) == Some("store-7")
        })
        .await;
        assert_eq!(snapshot.threads.len(), 1);
        assert_eq!(snapshot.threads[0].message_count, 1);
    }

    #[tokio::test]
    async fn test_open_thread_marks_read_and_persists() {
        let store = Arc::new(MemoryStore::new());
        store.push_page(vec![row("m1", "L1", "a", 100), row("m2", "L1", "b", 200)]);
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        let (handle, _task) = start(store.clone(), cache.clone()).await;

        wait_for(&handle, |s| s.total_unread == 2).await;
        handle
            .send(SyncCommand::OpenThread(ThreadKey::from("sms:L1")))
            .await
            .unwrap();
        wait_for(&handle, |s| s.total_unread == 0).await;

        let store_check = store.clone();
        eventually(async || store_check.marked.lock().unwrap().len() == 2).await;

        let cache_check = cache.clone();
        eventually(async || {
            let mut ids = cache_check.load_read_ids().await.unwrap();
            ids.sort();
            ids == vec!["m1".to_string(), "m2".to_string()]
        })
        .await;
    }

    #[tokio::test]
    async fn test_mark_read_not_found_purges_message() {
        let store = Arc::new(MemoryStore::new());
        store.push_page(vec![row("gone", "L1", "a", 100), row("kept", "L2", "b", 200)]);
        store.set_missing("gone");
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        let (handle, _task) = start(store.clone(), cache).await;

        wait_for(&handle, |s| s.threads.len() == 2).await;
        handle
            .send(SyncCommand::OpenThread(ThreadKey::from("sms:L1")))
            .await
            .unwrap();

        let snapshot = wait_for(&handle, |s| s.threads.len() == 1).await;
        assert_eq!(snapshot.threads[0].lead_id, "L2");
        assert!(snapshot.notice.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_sets_and_clears_notice() {
        let store = Arc::new(MemoryStore::new());
        store.push_failure("connection refused");
        store.push_page(vec![row("m1", "L1", "back online", 100)]);
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        let (handle, _task) = start(store.clone(), cache).await;

        let snapshot = wait_for(&handle, |s| s.notice.is_some()).await;
        assert!(snapshot.threads.is_empty());

        handle.send(SyncCommand::PollNow).await.unwrap();
        let snapshot = wait_for(&handle, |s| s.notice.is_none() && s.threads.len() == 1).await;
        assert_eq!(snapshot.threads[0].preview, "back online");
    }

    #[tokio::test]
    async fn test_read_cache_survives_restart() {
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        cache.commit_read_ids(&["m1".to_string()], 50).await.unwrap();
        cache
            .save_sync_state(SYNC_STATE_KEY, &SyncState::new(Some(900), 1))
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        // The store still claims unread; the local cache wins
        store.push_page(vec![row("m1", "L1", "a", 1_000)]);
        let (handle, _task) = start(store.clone(), cache).await;

        let snapshot = wait_for(&handle, |s| s.threads.len() == 1).await;
        assert_eq!(snapshot.total_unread, 0);

        // Full snapshot first, then deltas from the merged cursor
        handle.send(SyncCommand::PollNow).await.unwrap();
        let store_check = store.clone();
        eventually(async || store_check.fetch_calls.lock().unwrap().len() == 2).await;
        assert_eq!(
            *store.fetch_calls.lock().unwrap(),
            vec![None, Some(1_000 - 120)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::open_in_memory(500).await.unwrap());
        let (handle, task) = start(store, cache).await;

        handle.send(SyncCommand::Shutdown).await.unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(handle.send(SyncCommand::PollNow).await.is_err());
    }
}
