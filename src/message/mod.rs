//! Message model, deduplication and thread grouping.

pub mod dedup;
pub mod thread;
pub mod types;

pub use dedup::{DuplicateKey, Deduplicator};
pub use thread::{Thread, ThreadBook, ThreadKey};
pub use types::{CanonicalMessage, Channel, ChannelSet, Direction, MessageId, RawMessage, Source};
