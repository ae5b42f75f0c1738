//! The long-lived consumer of the `<prefix>:*` subscription.
//!
//! State machine: `Connecting -> Subscribed -> (Disconnected -> Connecting)*`.
//! A failed subscribe attempt counts against a fixed budget and is followed
//! by a fixed delay; a successful subscribe resets the count. Running out of
//! budget ends the runner with [`BridgeError::SubscriptionExhausted`].
//!
//! A subscription that goes quiet for a whole idle period gets a keepalive
//! published to this instance's own keepalive channel. If that does not come
//! back within another idle period the connection is treated as dead.

use crate::bus::PubSubBus;
use crate::control::InboundMessage;
use crate::error::BridgeError;
use crate::keys::KeySchema;
use crate::proxy::ProxyHandle;
use crate::registry::PresenceRegistry;
use crate::store::{Store, StoreMessage};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Where the runner is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Connecting,
    Subscribed,
    Disconnected,
    /// Shut down on request.
    Stopped,
    /// Gave up after exhausting the retry budget.
    Failed,
}

/// How the runner retries and how long it tolerates silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed subscribe attempts tolerated.
    pub budget: u32,
    /// Silence on the subscription before its liveness is checked.
    pub idle_timeout: Duration,
}

/// Holds the one pattern subscription and routes everything it receives.
///
/// Messages are handled one at a time in arrival order:
///
/// * `info-update-notify` goes to the presence registry
/// * Control channels run against the local proxy, doing nothing when the
///   named user is not connected here
/// * `pubsub` envelopes go to the bus
///
/// # Examples
///
/// ```rust,ignore
/// let runner = Arc::new(SubscriptionRunner::new(store, keys, registry, bus, proxy, policy));
/// let mut state = runner.state();
/// let task = tokio::spawn({
///     let runner = runner.clone();
///     async move { runner.run(shutdown_rx).await }
/// });
/// state.wait_for(|s| *s == RunnerState::Subscribed).await?;
/// ```
pub struct SubscriptionRunner {
    store: Arc<dyn Store>,
    keys: KeySchema,
    registry: Arc<PresenceRegistry>,
    bus: Arc<PubSubBus>,
    proxy: Arc<dyn ProxyHandle>,
    policy: ReconnectPolicy,
    state: watch::Sender<RunnerState>,
}

impl SubscriptionRunner {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySchema,
        registry: Arc<PresenceRegistry>,
        bus: Arc<PubSubBus>,
        proxy: Arc<dyn ProxyHandle>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(RunnerState::Connecting);
        Self {
            store,
            keys,
            registry,
            bus,
            proxy,
            policy,
            state,
        }
    }

    /// Watches state transitions.
    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RunnerState) {
        self.state.send_replace(next);
    }

    /// Runs until shutdown is signalled or the retry budget is spent.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), BridgeError> {
        let pattern = self.keys.subscribe_pattern();
        let keepalive = self.keys.keepalive_channel(self.registry.instance_id());
        let mut failures: u32 = 0;
        let mut subscribed_before = false;

        loop {
            self.set_state(RunnerState::Connecting);
            let attempt = tokio::select! {
                result = self.store.psubscribe(&pattern) => result,
                _ = shutdown.recv() => {
                    self.stop();
                    return Ok(());
                }
            };

            match attempt {
                Ok(mut stream) => {
                    failures = 0;
                    self.set_state(RunnerState::Subscribed);
                    info!("📡 Subscribed to {}", pattern);

                    if subscribed_before {
                        // notifications sent while we were away are gone
                        match self.registry.fetch_full().await {
                            Ok(count) => info!("🔄 Resynced {} presence record(s) after reconnect", count),
                            Err(e) => warn!("⚠️ Resync after reconnect failed: {}", e),
                        }
                    }
                    subscribed_before = true;

                    let mut keepalive_pending = false;
                    loop {
                        tokio::select! {
                            next = tokio::time::timeout(self.policy.idle_timeout, stream.next()) => match next {
                                Ok(Some(message)) => {
                                    keepalive_pending = false;
                                    self.route(message).await;
                                }
                                Ok(None) => break,
                                Err(_) if keepalive_pending => {
                                    warn!("⚠️ Subscription to {} went silent", pattern);
                                    break;
                                }
                                Err(_) => {
                                    keepalive_pending = true;
                                    self.send_keepalive(&keepalive).await;
                                }
                            },
                            _ = shutdown.recv() => {
                                self.stop();
                                return Ok(());
                            }
                        }
                    }
                    self.set_state(RunnerState::Disconnected);
                    warn!("⚠️ Subscription to {} lost, reconnecting", pattern);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.policy.budget {
                        self.set_state(RunnerState::Failed);
                        error!(
                            attempts = failures,
                            "❌ Giving up on subscription to {}: {}", pattern, e
                        );
                        return Err(BridgeError::SubscriptionExhausted {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    self.set_state(RunnerState::Disconnected);
                    warn!(
                        attempt = failures,
                        budget = self.policy.budget,
                        "⚠️ Subscribe to {} failed: {}", pattern, e
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = shutdown.recv() => {
                    self.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Any message proves the subscription alive, so the keepalive goes to a
    /// channel peers ignore. A failed publish is left to the idle check.
    async fn send_keepalive(&self, channel: &str) {
        debug!("Subscription idle, sending keepalive on {}", channel);
        if let Err(e) = self.store.publish(channel, "ping").await {
            warn!("⚠️ Keepalive not published: {}", e);
        }
    }

    fn stop(&self) {
        self.set_state(RunnerState::Stopped);
        info!("🛑 Subscription runner stopped");
    }

    /// Decodes one message and hands it to its consumer. Nothing here can
    /// end the receive loop.
    pub async fn route(&self, message: StoreMessage) {
        let decoded = match InboundMessage::decode(&self.keys, &message.channel, &message.payload) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!("Ignoring message on {}", message.channel);
                return;
            }
            Err(e) => {
                warn!("⚠️ Dropping message: {}", e);
                return;
            }
        };

        match decoded {
            InboundMessage::Presence(record) => {
                let id = record.id;
                if self.registry.receive_remote_notification(record).await {
                    debug!("Applied presence change for {}", id);
                }
            }
            InboundMessage::Control(command) => {
                if let Err(e) = command.execute(self.proxy.as_ref()).await {
                    warn!("⚠️ Control message {:?} failed: {}", command.kind(), e);
                }
            }
            InboundMessage::Bus(envelope) => self.bus.dispatch(&envelope).await,
        }
    }
}
