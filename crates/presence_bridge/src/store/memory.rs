//! In-process [`Store`] used for tests and single-host simulations.
//!
//! Several bridge instances can share one `Arc<MemoryStore>` and behave like
//! front ends talking to the same Redis. Outages and dropped subscriptions
//! can be injected to exercise the recovery paths.

use super::{glob_match, MessageStream, Store, StoreMessage};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<StoreMessage>,
}

/// A [`Store`] held entirely in process memory.
///
/// TTLs are honoured lazily: expired entries disappear on the next access.
/// Subscriptions are unbounded channels, so a slow reader never makes
/// `publish` wait.
///
/// # Examples
///
/// ```rust,ignore
/// let store = Arc::new(MemoryStore::new());
/// let a = BridgeContext::start(config.clone(), store.clone(), proxy_a).await?;
/// let b = BridgeContext::start(config, store.clone(), proxy_b).await?;
///
/// // cut both front ends off, then bring the store back
/// store.set_available(false);
/// store.set_available(true);
/// ```
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Subscriptions that stay open but never receive again.
    stalled: Mutex<Vec<Subscriber>>,
    unavailable: AtomicBool,
    failed_subscribes: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// An empty, reachable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage. Going down also drops every open subscription.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            self.disconnect_subscribers();
        }
    }

    /// Ends every open subscription stream as if the connection dropped.
    pub fn disconnect_subscribers(&self) {
        lock(&self.subscribers).clear();
    }

    /// Freezes every open subscription: its stream neither ends nor
    /// delivers, like a half-open connection.
    pub fn stall_subscribers(&self) {
        let frozen: Vec<Subscriber> = lock(&self.subscribers).drain(..).collect();
        lock(&self.stalled).extend(frozen);
    }

    /// Subscriptions that still receive messages.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = lock(&self.subscribers);
        subs.retain(|s| !s.sender.is_closed());
        subs.len()
    }

    /// Subscribe attempts rejected while the store was down.
    pub fn failed_subscribes(&self) -> u64 {
        self.failed_subscribes.load(Ordering::SeqCst)
    }

    /// Drops a key immediately, as if its TTL had run out.
    pub fn expire_now(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = lock(&self.entries);
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Whether `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        lock(&self.entries).get(key).is_some_and(|e| e.is_live(now))
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn live_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, e| e.is_live(now));
        entries
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.live_entries();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.live_entries().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        match self.live_entries().get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Hash(_)) => Err(StoreError::Protocol(format!(
                "WRONGTYPE {} holds a hash",
                key
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.live_entries().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        match self.live_entries().get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .live_entries()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        match self.live_entries().get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(Value::Text(_)) => Err(StoreError::Protocol(format!(
                "WRONGTYPE {} holds a string",
                key
            ))),
        }
    }

    async fn replace_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut store = self.live_entries();
        if entries.is_empty() {
            store.remove(key);
        } else {
            store.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(entries.clone()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut subs = lock(&self.subscribers);
        subs.retain(|s| !s.sender.is_closed());
        for sub in subs.iter().filter(|s| glob_match(&s.pattern, channel)) {
            let _ = sub.sender.send(StoreMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, StoreError> {
        if let Err(e) = self.check() {
            self.failed_subscribes.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(Subscriber {
            pattern: pattern.to_string(),
            sender,
        });
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_expire_reports_missing_keys() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(!store.expire("missing", ttl).await.unwrap());
        store.set_with_expiry("k", "v", ttl).await.unwrap();
        assert!(store.expire("k", ttl).await.unwrap());
        store.expire_now("k");
        assert!(!store.expire("k", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_lapse_after_ttl() {
        let store = MemoryStore::new();
        store.set_with_expiry("k", "v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_hash_drops_stale_fields() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        let first: HashMap<String, String> =
            [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())].into();
        store.replace_hash("h", &first, ttl).await.unwrap();

        let second: HashMap<String, String> = [("c".to_string(), "3".to_string())].into();
        store.replace_hash("h", &second, ttl).await.unwrap();
        assert_eq!(store.hash_get_all("h").await.unwrap(), second);

        store.replace_hash("h", &HashMap::new(), ttl).await.unwrap();
        assert!(!store.contains_key("h"));
    }

    #[tokio::test]
    async fn test_pattern_subscription_and_disconnect() {
        let store = MemoryStore::new();
        let mut stream = store.psubscribe("net:*").await.unwrap();

        store.publish("net:pubsub", "one").await.unwrap();
        store.publish("other:pubsub", "ignored").await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "net:pubsub");
        assert_eq!(msg.payload, "one");

        store.disconnect_subscribers();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_outage_fails_operations() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.psubscribe("*").await.is_err());
        assert_eq!(store.failed_subscribes(), 1);
        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
