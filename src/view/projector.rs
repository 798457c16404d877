//! Read-only thread list projection.
//!
//! Everything here is a pure function of the threads and the read oracle
//! passed in. Unread counts are recomputed on every call.

use serde::Serialize;

use crate::message::thread::{ReadOracle, Thread};
use crate::message::types::{ChannelSet, Direction, LeadId};

/// One row of the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub key: String,
    pub lead_id: LeadId,
    pub channels: ChannelSet,
    pub preview: String,
    pub last_message_id: String,
    pub last_timestamp: i64,
    pub last_direction: Direction,
    pub message_count: usize,
    pub unread_count: usize,
    pub has_attachments: bool,
}

impl ThreadSummary {
    pub fn has_unread(&self) -> bool {
        self.unread_count > 0
    }
}

fn summarize(thread: &Thread, read: &impl ReadOracle, preview_length: usize) -> Option<ThreadSummary> {
    // Empty threads are never shown
    let last = thread.last_message()?;
    Some(ThreadSummary {
        key: thread.key.to_string(),
        lead_id: thread.lead_id.clone(),
        channels: thread.channels(),
        preview: truncate_preview(last.preview_text(), preview_length),
        last_message_id: last.id.clone(),
        last_timestamp: last.timestamp,
        last_direction: last.direction,
        message_count: thread.len(),
        unread_count: thread.unread_count(read),
        has_attachments: thread.has_attachments(),
    })
}

/// Full thread listing, newest activity first.
pub fn project<'a>(
    threads: impl IntoIterator<Item = &'a Thread>,
    read: &impl ReadOracle,
    preview_length: usize,
) -> Vec<ThreadSummary> {
    let mut summaries: Vec<ThreadSummary> = threads
        .into_iter()
        .filter_map(|t| summarize(t, read, preview_length))
        .collect();

    summaries.sort_by(|a, b| {
        b.last_timestamp
            .cmp(&a.last_timestamp)
            .then_with(|| a.key.cmp(&b.key))
    });
    summaries
}

/// Notification feed: like [`project`] but threads whose latest message is
/// older than `retention_secs` before `now` are left out.
pub fn project_notifications<'a>(
    threads: impl IntoIterator<Item = &'a Thread>,
    read: &impl ReadOracle,
    now: i64,
    retention_secs: i64,
    preview_length: usize,
) -> Vec<ThreadSummary> {
    let cutoff = now.saturating_sub(retention_secs);
    project(threads, read, preview_length)
        .into_iter()
        .filter(|s| s.last_timestamp >= cutoff)
        .collect()
}

/// Everything the presentation layer needs, computed in one pass and
/// published as an immutable value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboxSnapshot {
    pub generated_at: i64,
    pub threads: Vec<ThreadSummary>,
    pub notifications: Vec<ThreadSummary>,
    pub total_unread: usize,
    /// Recoverable problem worth showing the user, e.g. an unreachable store
    pub notice: Option<String>,
}

/// Inbox-wide unread badge.
pub fn total_unread(summaries: &[ThreadSummary]) -> usize {
    summaries.iter().map(|s| s.unread_count).sum()
}

/// Collapse whitespace and cut to `max_chars`, marking the cut with "...".
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let keep = max_chars.saturating_sub(3);
    let mut cut: String = flat.chars().take(keep).collect();
    cut.push_str("...");
    cut
}
