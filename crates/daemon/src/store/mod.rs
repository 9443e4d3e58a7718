//! Persistence for channels and shares.
//!
//! Counters that many requests touch at once (share uses, channel
//! listeners) are only ever changed through single conditional updates
//! executed by the store, never by read-modify-write in the caller.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::channel::{Channel, ChannelDraft, ListenerCount};
use crate::share::{Share, ShareDraft};
use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// CRUD for channel records plus the supervisor's runtime writes.
pub trait ChannelStore: Send + Sync {
    fn insert_channel(&self, draft: &ChannelDraft) -> Result<Channel, StoreError>;

    fn channel(&self, id: i64) -> Result<Option<Channel>, StoreError>;

    fn channels(&self) -> Result<Vec<Channel>, StoreError>;

    /// Admin update. Never touches runtime fields. Returns false when the
    /// channel does not exist.
    fn update_channel(&self, id: i64, draft: &ChannelDraft) -> Result<bool, StoreError>;

    fn delete_channel(&self, id: i64) -> Result<bool, StoreError>;

    /// Record a freshly started encoder.
    fn set_process(&self, id: i64, pid: u32, start_date: i64) -> Result<(), StoreError>;

    /// Forget the encoder: pid, start date and current listeners go to zero,
    /// the peak is kept.
    fn clear_process(&self, id: i64) -> Result<(), StoreError>;

    /// Endpoint assigned at start time for channels without a fixed one.
    fn set_endpoint(&self, id: i64, interface: &str, port: u16) -> Result<(), StoreError>;

    /// Atomically add `delta` to the listener count (floored at zero) and
    /// raise the peak to match. `None` when the channel does not exist.
    fn apply_listener_delta(&self, id: i64, delta: i32)
        -> Result<Option<ListenerCount>, StoreError>;
}

/// CRUD for share records plus atomic access counting.
pub trait ShareStore: Send + Sync {
    fn insert_share(&self, draft: &ShareDraft, now: i64) -> Result<Share, StoreError>;

    fn share(&self, id: i64) -> Result<Option<Share>, StoreError>;

    fn delete_share(&self, id: i64) -> Result<bool, StoreError>;

    /// Count one use of the share if its quota still allows it.
    ///
    /// Returns whether the increment took effect; `false` means the quota
    /// was already used up at write time (or the share is gone).
    fn save_access(&self, id: i64, now: i64) -> Result<bool, StoreError>;
}
