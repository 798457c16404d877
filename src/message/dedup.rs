//! Collapses the several representations of one logical message into a
//! single canonical record.
//!
//! Lookup happens in two stages:
//! 1. Exact id (or a known alias of one) catches repeated poll rows and
//!    repeated push events.
//! 2. A content fingerprint plus a time tolerance catches the same message
//!    arriving through push and poll before the store has unified ids.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use super::types::{
    CanonicalMessage, Channel, Direction, MessageId, PROVISIONAL_ID_PREFIX, RawMessage, Source,
};
use crate::config::DedupConfig;

/// Content identity of a message, ignoring time: lead, channel, direction
/// and the normalized body prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DuplicateKey([u8; 32]);

impl DuplicateKey {
    pub fn new(
        lead_id: &str,
        channel: Channel,
        direction: Direction,
        body: &str,
        prefix_chars: usize,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(lead_id.as_bytes());
        hasher.update([0]);
        hasher.update(channel.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(direction.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(normalize_body(body, prefix_chars).as_bytes());
        Self(hasher.finalize().into())
    }

    fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Collapse whitespace runs, case-fold and keep the first `prefix_chars` chars.
pub fn normalize_body(body: &str, prefix_chars: usize) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(prefix_chars)
        .collect()
}

/// An authoritative instance replaced a provisional one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersession {
    pub old_id: MessageId,
    pub new_id: MessageId,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Canonical records touched by the batch, in first-seen order, one per id.
    pub canonical: Vec<CanonicalMessage>,
    pub superseded: Vec<Supersession>,
    pub duplicates: usize,
    pub dropped: usize,
}

impl IngestReport {
    fn emit(&mut self, positions: &mut HashMap<MessageId, usize>, message: CanonicalMessage) {
        match positions.get(&message.id) {
            Some(&pos) => self.canonical[pos] = message,
            None => {
                positions.insert(message.id.clone(), self.canonical.len());
                self.canonical.push(message);
            }
        }
    }

    fn rename(
        &mut self,
        positions: &mut HashMap<MessageId, usize>,
        old_id: &str,
        message: CanonicalMessage,
    ) {
        match positions.remove(old_id) {
            Some(pos) => {
                positions.insert(message.id.clone(), pos);
                self.canonical[pos] = message;
            }
            None => self.emit(positions, message),
        }
    }
}

pub struct Deduplicator {
    config: DedupConfig,
    by_id: HashMap<MessageId, CanonicalMessage>,
    /// Ids that lost a fuzzy match, pointing at the canonical id.
    aliases: HashMap<MessageId, MessageId>,
    by_key: HashMap<DuplicateKey, Vec<MessageId>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            by_id: HashMap::new(),
            aliases: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Map an id (canonical or alias) to its canonical id.
    pub fn resolve(&self, id: &str) -> Option<&MessageId> {
        if let Some((key, _)) = self.by_id.get_key_value(id) {
            return Some(key);
        }
        self.aliases.get(id)
    }

    /// Ids that were folded into `canonical`.
    pub fn aliases_of(&self, canonical: &str) -> Vec<MessageId> {
        self.aliases
            .iter()
            .filter(|(_, target)| target.as_str() == canonical)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalMessage> {
        self.resolve(id).and_then(|canonical| self.by_id.get(canonical))
    }

    /// Ingest a batch of raw messages. Safe to call repeatedly with
    /// overlapping batches.
    pub fn ingest(&mut self, batch: Vec<RawMessage>) -> IngestReport {
        let mut report = IngestReport::default();
        let mut positions: HashMap<MessageId, usize> = HashMap::new();

        for raw in batch {
            let (lead_id, timestamp) = match (raw.lead_id.as_deref(), raw.timestamp) {
                (Some(lead), Some(ts)) if !lead.trim().is_empty() => (lead.trim().to_string(), ts),
                _ => {
                    tracing::warn!(
                        "Dropping malformed message {:?}: missing lead id or timestamp",
                        raw.id
                    );
                    report.dropped += 1;
                    continue;
                }
            };

            let key = DuplicateKey::new(
                &lead_id,
                raw.channel,
                raw.direction,
                &raw.body,
                self.config.body_prefix_chars,
            );

            let store_id = raw.id.as_deref().map(str::trim).filter(|id| !id.is_empty());
            let (id, authoritative) = match store_id {
                Some(id) => (id.to_string(), true),
                None => (provisional_id(&key, timestamp), false),
            };

            // Stage 1: exact id or known alias
            if let Some(canonical_id) = self.resolve(&id).cloned() {
                if let Some(existing) = self.by_id.get_mut(&canonical_id) {
                    // Server read flag only ever moves false -> true
                    existing.server_read |= raw.server_read_flag;
                    let updated = existing.clone();
                    report.emit(&mut positions, updated);
                }
                continue;
            }

            let incoming = CanonicalMessage {
                id,
                lead_id,
                channel: raw.channel,
                direction: raw.direction,
                subject: raw.subject,
                body: raw.body,
                timestamp,
                server_read: raw.server_read_flag,
                attachments: raw.attachments,
                source: raw.source,
                authoritative,
            };

            // Stage 2: fuzzy content match within the time tolerance
            match self.find_fuzzy(&key, &incoming) {
                Some(existing_id) => {
                    let existing_authoritative = self
                        .by_id
                        .get(&existing_id)
                        .map(|m| m.authoritative)
                        .unwrap_or(true);

                    if incoming.authoritative && !existing_authoritative {
                        let new_id = incoming.id.clone();
                        let merged = self.supersede(&key, &existing_id, incoming);
                        tracing::debug!("Message {} superseded provisional {}", new_id, existing_id);
                        report.rename(&mut positions, &existing_id, merged);
                        report.superseded.push(Supersession {
                            old_id: existing_id,
                            new_id,
                        });
                    } else {
                        tracing::debug!(
                            "Message {} is a duplicate of {}",
                            incoming.id,
                            existing_id
                        );
                        self.aliases.insert(incoming.id.clone(), existing_id.clone());
                        if let Some(existing) = self.by_id.get_mut(&existing_id) {
                            existing.server_read |= incoming.server_read;
                            let updated = existing.clone();
                            report.emit(&mut positions, updated);
                        }
                        report.duplicates += 1;
                    }
                }
                None => {
                    self.by_key.entry(key).or_default().push(incoming.id.clone());
                    self.by_id.insert(incoming.id.clone(), incoming.clone());
                    report.emit(&mut positions, incoming);
                }
            }
        }

        report
    }

    /// Remove canonical records (and their aliases) from the index.
    pub fn forget(&mut self, ids: &[MessageId]) {
        for id in ids {
            let Some(message) = self.by_id.remove(id) else {
                continue;
            };
            let key = DuplicateKey::new(
                &message.lead_id,
                message.channel,
                message.direction,
                &message.body,
                self.config.body_prefix_chars,
            );
            if let Some(members) = self.by_key.get_mut(&key) {
                members.retain(|m| m != id);
                if members.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
        self.aliases.retain(|_, target| self.by_id.contains_key(target));
    }

    fn window_for(&self, a: Source, b: Source) -> i64 {
        if a == b {
            self.config.same_source_window_secs
        } else {
            self.config.cross_source_window_secs
        }
    }

    fn find_fuzzy(&self, key: &DuplicateKey, incoming: &CanonicalMessage) -> Option<MessageId> {
        let candidates = self.by_key.get(key)?;
        candidates
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|existing| {
                let window = self.window_for(existing.source, incoming.source);
                (existing.timestamp - incoming.timestamp).abs() <= window
            })
            .min_by_key(|existing| (existing.timestamp - incoming.timestamp).abs())
            .map(|existing| existing.id.clone())
    }

    /// Replace a provisional record with an authoritative one, keeping any
    /// read assertion the provisional copy already carried.
    fn supersede(
        &mut self,
        key: &DuplicateKey,
        old_id: &MessageId,
        mut incoming: CanonicalMessage,
    ) -> CanonicalMessage {
        if let Some(old) = self.by_id.remove(old_id) {
            incoming.server_read |= old.server_read;
        }
        let new_id = incoming.id.clone();

        if let Some(members) = self.by_key.get_mut(key) {
            for member in members.iter_mut() {
                if member == old_id {
                    *member = new_id.clone();
                }
            }
        }
        for target in self.aliases.values_mut() {
            if target == old_id {
                *target = new_id.clone();
            }
        }
        self.aliases.insert(old_id.clone(), new_id.clone());
        self.by_id.insert(new_id, incoming.clone());
        incoming
    }
}

fn provisional_id(key: &DuplicateKey, timestamp: i64) -> MessageId {
    format!("{}{}-{}", PROVISIONAL_ID_PREFIX, &key.hex()[..16], timestamp)
}
