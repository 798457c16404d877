//! Engine-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable. Most of these are
//! defaults for values that can be overridden in the config file.

/// Characters of normalized body that participate in duplicate detection.
pub const DUPLICATE_BODY_PREFIX_CHARS: usize = 160;

/// Tolerance in seconds for repeats arriving through the same source.
pub const SAME_SOURCE_WINDOW_SECS: i64 = 10;

/// Tolerance in seconds for push vs. poll races, before the store has
/// unified identifiers.
pub const CROSS_SOURCE_WINDOW_SECS: i64 = 120;

/// Maximum number of read ids kept in the persisted cache.
pub const READ_CACHE_CAPACITY: usize = 500;

/// Deleted ids remembered before the oldest are forgotten.
pub const TOMBSTONE_CAPACITY: usize = 5_000;

/// Age in days after which threads leave the notification feed.
pub const NOTIFICATION_RETENTION_DAYS: i64 = 7;

/// Command channel capacity for the sync actor.
/// Sized for bursts of push events during a large poll.
pub const ACTOR_COMMAND_CAPACITY: usize = 256;

/// Account key for the sync cursor row in the local cache.
pub const SYNC_STATE_KEY: &str = "default";
