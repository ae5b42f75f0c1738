//! Shared store abstraction.
//!
//! The bridge only needs a handful of hand-shaped operations, all expressed
//! here. [`RedisStore`] is the production backend; [`MemoryStore`] runs the
//! same contract in-process so several simulated front ends can share it.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// One message delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of subscription messages. It ends when the connection is lost.
pub type MessageStream = BoxStream<'static, StoreMessage>;

/// Key/value store with TTLs, hashes and pattern pub/sub.
///
/// Every operation is bounded by the store's configured timeout and fails
/// with [`StoreError::Timeout`] rather than hanging.
///
/// # Examples
///
/// ```rust,ignore
/// let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
/// store.set_with_expiry("presence:players:a", "{}", Duration::from_secs(60)).await?;
/// assert!(store.get("presence:players:a").await?.is_some());
/// ```
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic set-if-absent with expiry. `false` when the key already exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Unconditional set with expiry.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Re-applies a TTL. `false` when the key no longer exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Every key matching a glob pattern such as `prefix:players:*`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomically replaces a whole hash and its TTL. Empty entries delete the key.
    async fn replace_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fire-and-forget publish to a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Opens a dedicated subscription for a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, StoreError>;
}

/// Glob matching with `*` and `?`, enough for the patterns the bridge issues.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Whole seconds for a TTL, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("net:*", "net:pubsub"));
        assert!(glob_match("net:players:*", "net:players:abc:lobby"));
        assert!(!glob_match("net:players:*", "net:ip:abc:lobby"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("net:*", "net"));
    }

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }
}
