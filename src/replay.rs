//! Offline replay: feed a recorded JSON-lines script through the engine.
//!
//! Each non-empty line is one step:
//!
//! ```text
//! {"step":"poll","messages":[{"id":"m1","leadId":"L1","channel":"sms","direction":"received","body":"hi","timestamp":100}]}
//! {"step":"event","event":{"type":"message_read","messageId":"m1"}}
//! {"step":"open_thread","key":"sms:L1"}
//! {"step":"store_not_found","id":"m2"}
//! ```
//!
//! Lines starting with `#` are comments. Mark-read commands produced by
//! `open_thread` are treated as accepted by the store.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::BufRead;

use crate::message::thread::ThreadKey;
use crate::message::types::{MessageId, decode_rows};
use crate::sync::engine::{ApplyReport, SyncEngine};
use crate::sync::events::InboundEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    /// Rows are decoded one by one, like a store page
    Poll { messages: Vec<serde_json::Value> },
    Event { event: InboundEvent },
    OpenThread { key: String },
    StoreNotFound { id: MessageId },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub steps: usize,
    /// Lines that could not be decoded and were skipped
    pub skipped: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub ignored: usize,
}

impl ReplayStats {
    fn absorb(&mut self, report: &ApplyReport) {
        self.duplicates += report.duplicates;
        self.dropped += report.dropped;
        self.ignored += report.ignored;
    }
}

pub fn apply_step(engine: &mut SyncEngine, step: ReplayStep) -> ApplyReport {
    match step {
        ReplayStep::Poll { messages } => {
            let (messages, dropped) = decode_rows(messages);
            let mut report = engine.ingest(messages);
            report.dropped += dropped;
            report
        }
        ReplayStep::Event { event } => engine.apply_event(event),
        ReplayStep::OpenThread { key } => {
            let report = engine.open_thread(&ThreadKey::from(key.as_str()));
            for id in &report.mark_read {
                engine.mark_read_confirmed(id);
            }
            report
        }
        ReplayStep::StoreNotFound { id } => engine.purge(&id),
    }
}

/// Run every step in `reader` against `engine`.
pub fn replay(engine: &mut SyncEngine, reader: impl BufRead) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read replay line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<ReplayStep>(line) {
            Ok(step) => {
                let report = apply_step(engine, step);
                stats.absorb(&report);
                stats.steps += 1;
            }
            Err(e) => {
                tracing::warn!("Skipping replay line {}: {}", index + 1, e);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}
