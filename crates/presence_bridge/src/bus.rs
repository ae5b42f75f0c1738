//! Named-channel application messaging.
//!
//! All bus traffic travels as [`PubSubEnvelope`] JSON on the single
//! `<prefix>:pubsub` channel and is fanned out locally by channel key.
//! Envelopes carrying this instance's own id are dropped on receipt, which
//! is the only thing preventing a publisher from reacting to itself.

use crate::error::{BridgeError, HandlerError};
use crate::keys::{ChannelKind, KeySchema};
use crate::store::Store;
use crate::types::{InstanceId, PubSubEnvelope};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Receives payloads published under one channel key.
///
/// Handlers run on the subscription worker, one after another, in the order
/// they were registered. A handler may await other bridge components such as
/// the presence registry; no bus or registry lock is held while it runs.
/// Anything slow should be spawned instead, since the next message waits.
///
/// Most callers register a closure with [`PubSubBus::on`]. Implement this
/// trait directly when the handler needs async work:
///
/// ```rust,ignore
/// struct Locate {
///     registry: Arc<PresenceRegistry>,
/// }
///
/// #[async_trait]
/// impl MessageHandler for Locate {
///     async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
///         let id = PlayerId::parse(payload)
///             .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
///         if let Some(record) = self.registry.get(id).await {
///             info!("{} is on {:?}", record.name(), record.backend);
///         }
///         Ok(())
///     }
///
///     fn handler_name(&self) -> &str {
///         "locate"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one payload.
    ///
    /// # Returns
    ///
    /// `Err` is logged and counted as a handler failure. It never reaches the
    /// publisher and never stops delivery to other handlers.
    async fn handle(&self, payload: &str) -> Result<(), HandlerError>;

    /// Human-readable name used in logs.
    fn handler_name(&self) -> &str;
}

/// Adapts a synchronous closure into a [`MessageHandler`].
pub struct FnHandler<F>
where
    F: Fn(&str) -> Result<(), HandlerError> + Send + Sync,
{
    name: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&str) -> Result<(), HandlerError> + Send + Sync,
{
    /// # Arguments
    ///
    /// * `name` - Shown in logs when the handler fails
    /// * `handler` - Called with each payload
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self { name: name.into(), handler }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&str) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        (self.handler)(payload)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    pub self_filtered: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    self_filtered: AtomicU64,
    handler_failures: AtomicU64,
}

/// Application-level messaging between front ends.
///
/// Any number of handlers may listen on a channel key; they are invoked in
/// registration order for every envelope that passes the origin filter. The
/// bus itself holds no connection: publishing goes through the store and
/// receiving is driven by the subscription runner calling
/// [`dispatch`](Self::dispatch).
///
/// # Examples
///
/// ```rust,ignore
/// bus.on("staff-chat", |payload| {
///     info!("staff: {}", payload);
///     Ok(())
/// });
///
/// // every other front end's "staff-chat" handlers fire, ours do not
/// bus.publish("staff-chat", "server restart in 5 minutes", false).await?;
/// ```
pub struct PubSubBus {
    store: Arc<dyn Store>,
    keys: KeySchema,
    instance_id: InstanceId,
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
    counters: Counters,
}

impl std::fmt::Debug for PubSubBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBus")
            .field("instance_id", &self.instance_id)
            .field("handlers", &"[handlers]")
            .finish()
    }
}

impl PubSubBus {
    /// Creates a bus with no handlers. `instance_id` is stamped on outgoing
    /// envelopes and used to drop our own on the way back in.
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, instance_id: InstanceId) -> Self {
        Self {
            store,
            keys,
            instance_id,
            handlers: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Adds a handler for `channel_key`. Earlier handlers stay registered.
    pub fn register(&self, channel_key: &str, handler: Arc<dyn MessageHandler>) {
        debug!("📝 Registered bus handler {} for {}", handler.handler_name(), channel_key);
        self.handlers
            .entry(channel_key.to_string())
            .or_default()
            .push(handler);
    }

    /// Registers a closure as a handler.
    pub fn on<F>(&self, channel_key: &str, handler: F)
    where
        F: Fn(&str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let name = format!("{}#{}", channel_key, self.handler_count(channel_key));
        self.register(channel_key, Arc::new(FnHandler::new(name, handler)));
    }

    /// Drops every handler for `channel_key`. Messages for it are ignored
    /// from then on.
    pub fn unregister_all(&self, channel_key: &str) {
        if let Some((_, removed)) = self.handlers.remove(channel_key) {
            debug!("🗑️ Dropped {} bus handler(s) for {}", removed.len(), channel_key);
        }
    }

    /// Handlers currently registered for `channel_key`.
    pub fn handler_count(&self, channel_key: &str) -> usize {
        self.handlers.get(channel_key).map_or(0, |h| h.len())
    }

    /// Publishes `payload` under `channel_key` to every front end.
    ///
    /// # Arguments
    ///
    /// * `channel_key` - Application channel, independent of store channels
    /// * `payload` - Delivered to handlers unchanged
    /// * `include_self` - When `true` the envelope carries no origin, so this
    ///   instance's handlers fire too
    ///
    /// # Returns
    ///
    /// An error only if the envelope could not be serialized or published.
    /// Nothing is known about delivery.
    pub async fn publish(
        &self,
        channel_key: &str,
        payload: &str,
        include_self: bool,
    ) -> Result<(), BridgeError> {
        let envelope = PubSubEnvelope {
            channel_key: channel_key.to_string(),
            payload: payload.to_string(),
            origin: if include_self { None } else { Some(self.instance_id.clone()) },
        };
        let json = serde_json::to_string(&envelope)?;
        self.store
            .publish(&self.keys.channel(ChannelKind::PubSub), &json)
            .await?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delivers an envelope to local handlers. Handler errors and panics are
    /// logged per handler and never reach the caller.
    ///
    /// Envelopes stamped with this instance's own id are dropped, as are keys
    /// with no handler. Handlers for one key run sequentially, each awaited to
    /// completion before the next starts.
    pub async fn dispatch(&self, envelope: &PubSubEnvelope) {
        if envelope.origin.as_ref() == Some(&self.instance_id) {
            self.counters.self_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // clone out so no map shard stays locked while handlers run
        let Some(handlers) = self
            .handlers
            .get(&envelope.channel_key)
            .map(|entry| entry.value().clone())
        else {
            return;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(&envelope.payload))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        channel = %envelope.channel_key,
                        "❌ Bus handler {} failed: {}",
                        handler.handler_name(),
                        e
                    );
                }
                Err(_) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        channel = %envelope.channel_key,
                        "❌ Bus handler {} panicked",
                        handler.handler_name()
                    );
                }
            }
        }
    }

    /// Snapshot of the counters since startup.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            self_filtered: self.counters.self_filtered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PresenceRegistry;
    use crate::store::MemoryStore;
    use crate::types::{PlayerId, PresenceRecord};
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;

    fn bus(id: &str) -> PubSubBus {
        PubSubBus::new(
            Arc::new(MemoryStore::new()),
            KeySchema::default(),
            InstanceId::new(id).unwrap(),
        )
    }

    fn envelope(key: &str, payload: &str, origin: Option<&str>) -> PubSubEnvelope {
        PubSubEnvelope {
            channel_key: key.to_string(),
            payload: payload.to_string(),
            origin: origin.map(|o| InstanceId::new(o).unwrap()),
        }
    }

    fn recorder(bus: &PubSubBus, key: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(key, move |payload| {
            sink.lock().unwrap().push(payload.to_string());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn test_self_origin_is_filtered() {
        let bus = bus("AAAAAAAA");
        let seen = recorder(&bus, "chat");

        bus.dispatch(&envelope("chat", "mine", Some("AAAAAAAA"))).await;
        bus.dispatch(&envelope("chat", "theirs", Some("BBBBBBBB"))).await;
        bus.dispatch(&envelope("chat", "everyone", None)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["theirs".to_string(), "everyone".to_string()]);
        assert_eq!(bus.stats().self_filtered, 1);
    }

    #[tokio::test]
    async fn test_all_handlers_for_a_key_run() {
        let bus = bus("AAAAAAAA");
        let first = recorder(&bus, "chat");
        let second = recorder(&bus, "chat");
        let other = recorder(&bus, "trade");

        bus.dispatch(&envelope("chat", "hi", None)).await;
        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
        assert!(other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_others() {
        let bus = bus("AAAAAAAA");
        bus.on("chat", |_| Err(HandlerError::Failed("boom".to_string())));
        bus.on("chat", |_| panic!("handler bug"));
        let seen = recorder(&bus, "chat");

        bus.dispatch(&envelope("chat", "still delivered", None)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[tokio::test]
    async fn test_unregister_all_and_unknown_keys() {
        let bus = bus("AAAAAAAA");
        let seen = recorder(&bus, "chat");
        bus.unregister_all("chat");
        bus.dispatch(&envelope("chat", "dropped", None)).await;
        bus.dispatch(&envelope("nobody-listens", "dropped", None)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.handler_count("chat"), 0);
    }

    #[tokio::test]
    async fn test_publish_wire_format() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySchema::default();
        let mut sub = store.psubscribe(&keys.subscribe_pattern()).await.unwrap();
        let bus = PubSubBus::new(store.clone(), keys.clone(), InstanceId::new("AAAAAAAA").unwrap());

        bus.publish("chat", "hello", false).await.unwrap();
        bus.publish("chat", "hello", true).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.channel, "velocity-redis-bridge:pubsub");
        assert_eq!(
            first.payload,
            r#"{"key":"chat","message":"hello","publisherVelocityId":"AAAAAAAA"}"#
        );
        let second = sub.next().await.unwrap();
        assert_eq!(second.payload, r#"{"key":"chat","message":"hello"}"#);
        assert_eq!(bus.stats().published, 2);
    }

    /// Answers "where is this user" lookups from the local registry.
    struct LocateHandler {
        registry: Arc<PresenceRegistry>,
        found: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl MessageHandler for LocateHandler {
        async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
            let id = PlayerId::parse(payload)
                .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
            let backend = self.registry.get(id).await.and_then(|record| record.backend);
            self.found.lock().unwrap().push(backend);
            Ok(())
        }

        fn handler_name(&self) -> &str {
            "locate"
        }
    }

    #[tokio::test]
    async fn test_async_handler_reads_registry() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySchema::default();
        let instance = InstanceId::new("AAAAAAAA").unwrap();
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            keys.clone(),
            instance.clone(),
            Duration::from_secs(600),
        ));
        let bus = PubSubBus::new(store, keys, instance.clone());
        let alice = PlayerId::new();
        registry
            .register(PresenceRecord::new(
                alice,
                "Alice",
                "10.0.0.1:40000".parse().unwrap(),
                instance,
                Some("lobby".to_string()),
            ))
            .await
            .unwrap();

        let handler = Arc::new(LocateHandler {
            registry,
            found: Mutex::new(Vec::new()),
        });
        bus.register("locate", handler.clone());

        bus.dispatch(&envelope("locate", &alice.to_string(), Some("BBBBBBBB"))).await;
        bus.dispatch(&envelope("locate", &PlayerId::new().to_string(), None)).await;
        bus.dispatch(&envelope("locate", "not-an-id", None)).await;

        assert_eq!(
            *handler.found.lock().unwrap(),
            vec![Some("lobby".to_string()), None]
        );
        assert_eq!(bus.stats().handler_failures, 1);
    }
}
