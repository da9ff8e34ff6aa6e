//! The coordination-store contract.
//!
//! Consumers only ever see this trait; the in-process backend in
//! [`crate::memory`] implements the full contract, and a networked
//! backend can slot in without touching any caller. All operations are
//! assumed low-latency and available from every worker instance.

use std::time::Duration;

use async_trait::async_trait;
use kiln_domain::Result;
use tokio::sync::broadcast;

/// Default safety TTL. Every key written by the core carries a TTL; this
/// is the ceiling used when no tighter bound applies.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Unconditional write.
    Always,
    /// Write only when the key does not exist (SET NX).
    IfAbsent,
}

/// Keyed store with TTLs, atomic conditional updates, append-only lists,
/// pub/sub channels and cursor-style scans.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Returns true when the value was written (always true for
    /// [`SetMode::Always`]).
    async fn set(&self, key: &str, value: &str, ttl: Duration, mode: SetMode) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns true when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Refresh a key's TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomic compare-and-set: write `new` only when the current value
    /// equals `expected`. The server-evaluated-script equivalent used for
    /// stale-lock reclamation.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomic conditional delete: remove the key only when its current
    /// value starts with `prefix`. Lock release goes through this —
    /// unconditional lock deletion is forbidden.
    async fn delete_if_prefix(&self, key: &str, prefix: &str) -> Result<bool>;

    /// Append to the right of a list, creating it (with `ttl`) if absent.
    /// Returns the new length.
    async fn list_push(&self, key: &str, item: &str, ttl: Duration) -> Result<usize>;

    /// Inclusive range read; negative indices count from the end
    /// (`-1` is the last element).
    async fn list_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Fire-and-forget broadcast. Returns the number of subscribers the
    /// message reached.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Open a fresh pub/sub session on one channel. Each subscriber gets
    /// its own session; dropping it releases the subscription.
    fn subscribe(&self, channel: &str) -> Subscription;

    /// Cursor-based key scan supporting `*` wildcards. Never blocks the
    /// keyspace.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
}

/// One pub/sub session. Messages published while nobody is awaiting
/// `recv` are buffered up to the channel capacity; overflow is reported
/// and skipped rather than blocking the publisher.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: String, rx: broadcast::Receiver<String>) -> Self {
        Self { channel, rx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` when the channel has been torn down.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        channel = %self.channel,
                        missed,
                        "pub/sub subscriber lagged, skipping missed messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
