//! Runtime composition of one front end's bridge.
//!
//! [`BridgeContext`] owns every component and background task. There is no
//! process-wide state: two contexts sharing a store behave like two front
//! ends of the same cluster.

use crate::api::{ClusterApi, SessionHooks};
use crate::bus::PubSubBus;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::identity::InstanceIdentityLeaser;
use crate::keys::KeySchema;
use crate::plugin_message::PluginMessageBridge;
use crate::proxy::ProxyHandle;
use crate::registry::PresenceRegistry;
use crate::runner::{ReconnectPolicy, RunnerState, SubscriptionRunner};
use crate::store::Store;
use crate::types::{InstanceId, PlayerId};
use crate::view::{IpViewCache, PlayerViewCache, RosterPublisher};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One running front end's membership in the cluster.
///
/// Created by [`start`](Self::start) and consumed by
/// [`shutdown`](Self::shutdown). In between, the proxy adapter feeds
/// connection events into [`hooks`](Self::hooks), answers plugin messages
/// through [`plugin_messages`](Self::plugin_messages) and runs cluster
/// commands through [`api`](Self::api).
///
/// Background tasks started with the context:
///
/// * **Subscription runner**: applies peer notifications, control messages
///   and bus envelopes
/// * **Identity renewal**: keeps the instance id lease alive
/// * **Lease refresh**: re-asserts the TTL of every locally owned record
/// * **Full refetch**: rebuilds the registry from the store
/// * **Roster cycle**: publishes this front end's rosters and rebuilds both
///   views
///
/// # Examples
///
/// ```rust,ignore
/// let store = Arc::new(RedisStore::connect(&config.store).await?);
/// let context = BridgeContext::start(config, store, proxy).await?;
///
/// tokio::select! {
///     _ = shutdown_requested() => {}
///     Some(e) = context.wait_fatal() => error!("bridge failed: {}", e),
/// }
/// context.shutdown().await;
/// ```
pub struct BridgeContext {
    instance_id: InstanceId,
    api: Arc<ClusterApi>,
    hooks: Arc<SessionHooks>,
    plugin_messages: Arc<PluginMessageBridge>,
    runner_state: watch::Receiver<RunnerState>,
    shutdown: broadcast::Sender<()>,
    fatal: Mutex<Option<oneshot::Receiver<BridgeError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeContext {
    /// Joins the cluster: claims an instance id, loads the current presence
    /// set and starts every background task.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before any store access
    /// * `store` - Shared store; also used for the subscription
    /// * `proxy` - Adapter for the connections this front end holds
    ///
    /// # Returns
    ///
    /// An error when the configuration is invalid, the store is unreachable
    /// while claiming an id, or the initial presence load fails. No task is
    /// left running in that case.
    pub async fn start(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        proxy: Arc<dyn ProxyHandle>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let keys = KeySchema::new(config.key_prefix.clone());

        let leaser = Arc::new(InstanceIdentityLeaser::new(
            store.clone(),
            keys.clone(),
            config.identity_lease(),
        ));
        let instance_id = leaser.claim().await?;

        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            keys.clone(),
            instance_id.clone(),
            config.cache_expiry(),
        ));
        let players = Arc::new(PlayerViewCache::new(store.clone(), keys.clone()));
        let ips = Arc::new(IpViewCache::new(store.clone(), keys.clone()));
        let bus = Arc::new(PubSubBus::new(store.clone(), keys.clone(), instance_id.clone()));
        let publisher = Arc::new(RosterPublisher::new(
            store.clone(),
            keys.clone(),
            instance_id.clone(),
            config.cache_expiry(),
        ));
        let api = Arc::new(ClusterApi::new(
            store.clone(),
            keys.clone(),
            registry.clone(),
            players.clone(),
            ips.clone(),
            bus.clone(),
            proxy.clone(),
        ));
        let hooks = Arc::new(SessionHooks::new(registry.clone()));
        let plugin_messages = Arc::new(PluginMessageBridge::new(api.clone()));

        let loaded = registry.fetch_full().await?;
        info!("📥 Loaded {} presence record(s) from the store", loaded);

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(leaser.spawn_renewal(
            instance_id.clone(),
            config.identity_renew(),
            shutdown.subscribe(),
        ));

        let runner = Arc::new(SubscriptionRunner::new(
            store,
            keys,
            registry.clone(),
            bus,
            proxy.clone(),
            ReconnectPolicy {
                delay: config.reconnect_delay(),
                budget: config.reconnect_budget,
                idle_timeout: config.subscription_idle_timeout(),
            },
        ));
        let runner_state = runner.state();
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let runner_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(runner_shutdown).await {
                error!("❌ Subscription runner ended: {}", e);
                let _ = fatal_tx.send(e);
            }
        }));

        {
            let registry = registry.clone();
            let proxy = proxy.clone();
            tasks.push(spawn_periodic(
                "lease refresh",
                config.lease_refresh_period(),
                shutdown.subscribe(),
                move || {
                    let registry = registry.clone();
                    let proxy = proxy.clone();
                    async move {
                        let outcome = registry.refresh_leases(&proxy.local_players()).await?;
                        if outcome.lost > 0 {
                            warn!("⚠️ {} local presence record(s) now owned elsewhere", outcome.lost);
                        }
                        debug!(
                            "🔄 Refreshed leases: {} renewed, {} re-registered",
                            outcome.renewed, outcome.reregistered
                        );
                        Ok(())
                    }
                },
            ));
        }

        {
            let registry = registry.clone();
            tasks.push(spawn_periodic(
                "full refetch",
                config.cache_update_interval(),
                shutdown.subscribe(),
                move || {
                    let registry = registry.clone();
                    async move {
                        let count = registry.fetch_full().await?;
                        debug!("🔄 Refetched {} presence record(s)", count);
                        Ok(())
                    }
                },
            ));
        }

        tasks.push(spawn_periodic(
            "roster publish",
            config.cache_update_interval(),
            shutdown.subscribe(),
            move || {
                let publisher = publisher.clone();
                let players = players.clone();
                let ips = ips.clone();
                let proxy = proxy.clone();
                async move {
                    publisher
                        .publish(&proxy.backend_names(), &proxy.local_players())
                        .await?;
                    let listed = players.rebuild().await?;
                    ips.rebuild().await?;
                    debug!("📋 Rebuilt roster views with {} user(s)", listed);
                    Ok(())
                }
            },
        ));

        info!("✅ Bridge running as instance {}", instance_id);
        Ok(Self {
            instance_id,
            api,
            hooks,
            plugin_messages,
            runner_state,
            shutdown,
            fatal: Mutex::new(Some(fatal_rx)),
            tasks,
        })
    }

    /// The id leased at startup.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn api(&self) -> &Arc<ClusterApi> {
        &self.api
    }

    /// Connection lifecycle entry points for the proxy adapter.
    pub fn hooks(&self) -> &Arc<SessionHooks> {
        &self.hooks
    }

    pub fn plugin_messages(&self) -> &Arc<PluginMessageBridge> {
        &self.plugin_messages
    }

    /// Follows the subscription runner through its states.
    pub fn runner_state(&self) -> watch::Receiver<RunnerState> {
        self.runner_state.clone()
    }

    pub fn status_line(&self, viewer: Option<PlayerId>) -> String {
        self.api.status_line(viewer)
    }

    /// Resolves with the error that stopped the subscription runner. Returns
    /// `None` when the runner ended cleanly or the error was already taken.
    pub async fn wait_fatal(&self) -> Option<BridgeError> {
        let receiver = self.fatal.lock().await.take()?;
        receiver.await.ok()
    }

    /// Signals every background task and waits for them to finish.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down bridge instance {}", self.instance_id);
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("⚠️ Background task ended abnormally: {}", e);
            }
        }
        info!("✅ Bridge instance {} stopped", self.instance_id);
    }
}

/// Runs `cycle` every `period` until shutdown. A failed cycle is logged and
/// skipped; the next tick tries again.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BridgeError>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = cycle().await {
                        warn!("⚠️ Periodic {} skipped: {}", name, e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Periodic {} stopped", name);
    })
}
