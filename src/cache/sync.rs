/// Where the last poll left off, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Highest store timestamp ingested so far
    pub cursor: Option<i64>,
    /// Wall-clock time of the last successful poll
    pub last_sync: Option<i64>,
}

impl SyncState {
    pub fn new(cursor: Option<i64>, last_sync: i64) -> Self {
        Self {
            cursor,
            last_sync: Some(last_sync),
        }
    }

    /// A cursor never moves backwards, even if an older state is saved later.
    pub fn merge(&self, newer: &SyncState) -> SyncState {
        SyncState {
            cursor: match (self.cursor, newer.cursor) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            last_sync: newer.last_sync.or(self.last_sync),
        }
    }
}
