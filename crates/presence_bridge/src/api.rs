//! Entry points used by the proxy adapter and by application code.
//!
//! [`ClusterApi`] acts on a user wherever they are connected: locally when
//! the user sits on this front end, otherwise by publishing a control message
//! that the owning front end picks up. [`SessionHooks`] turns the proxy's
//! login, backend switch and disconnect events into registry writes.

use crate::bus::PubSubBus;
use crate::control::ControlMessage;
use crate::error::BridgeError;
use crate::keys::KeySchema;
use crate::proxy::ProxyHandle;
use crate::registry::PresenceRegistry;
use crate::store::Store;
use crate::types::{InstanceId, LocalPlayer, PlayerId, PresenceRecord};
use crate::view::{IpViewCache, PlayerViewCache};
use std::sync::Arc;
use tracing::{debug, info};

/// Shown to a user whose id is already connected elsewhere in the cluster.
pub const ALREADY_CONNECTED_REASON: &str = "You are already connected to this network!";

/// Cluster-wide commands and queries for one front end.
///
/// Commands addressed to a user by name run directly against the local
/// proxy when the user is connected here and are otherwise published as a
/// control message; the front end that owns the user executes it. Nothing
/// reports back whether a remote front end found the user.
///
/// Queries read the presence registry, so they reflect every notification
/// processed so far and never block on the store.
///
/// # Examples
///
/// ```rust,ignore
/// let api = context.api();
///
/// api.send_player("Alice", "survival").await?;
/// api.send_message_to_all("Maintenance at 03:00 UTC").await?;
///
/// if let Some(record) = api.player_by_name("Bob").await {
///     println!("Bob is on {:?} via {:?}", record.backend, record.front_end);
/// }
/// println!("{} online", api.online_count().await);
/// ```
pub struct ClusterApi {
    store: Arc<dyn Store>,
    keys: KeySchema,
    registry: Arc<PresenceRegistry>,
    players: Arc<PlayerViewCache>,
    ips: Arc<IpViewCache>,
    bus: Arc<PubSubBus>,
    proxy: Arc<dyn ProxyHandle>,
}

impl ClusterApi {
    /// Wires the API to already constructed components. Normally done by
    /// [`BridgeContext::start`](crate::context::BridgeContext::start).
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySchema,
        registry: Arc<PresenceRegistry>,
        players: Arc<PlayerViewCache>,
        ips: Arc<IpViewCache>,
        bus: Arc<PubSubBus>,
        proxy: Arc<dyn ProxyHandle>,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            players,
            ips,
            bus,
            proxy,
        }
    }

    /// This front end's leased id.
    pub fn instance_id(&self) -> &InstanceId {
        self.registry.instance_id()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Moves a user to `backend`, wherever they are connected.
    ///
    /// # Arguments
    ///
    /// * `player` - Display name, matched case-insensitively by the owner
    /// * `backend` - Target backend name as the proxy knows it
    ///
    /// # Returns
    ///
    /// `Ok(())` once the move was started locally or the request published.
    /// Unknown users and backends are not detected here.
    pub async fn send_player(&self, player: &str, backend: &str) -> Result<(), BridgeError> {
        self.targeted(ControlMessage::SendToBackend {
            player: player.to_string(),
            backend: backend.to_string(),
        })
        .await
    }

    /// Every front end, this one included, broadcasts to its own users.
    pub async fn send_message_to_all(&self, text: &str) -> Result<(), BridgeError> {
        self.publish_control(&ControlMessage::BroadcastMessage { text: text.to_string() })
            .await
    }

    /// Sends a plain chat message to one user.
    pub async fn send_message_to_player(&self, player: &str, text: &str) -> Result<(), BridgeError> {
        self.targeted(ControlMessage::MessagePlayer {
            player: player.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// Broadcasts a pre-serialized JSON chat component to everyone.
    pub async fn send_raw_message_to_all(&self, json: &str) -> Result<(), BridgeError> {
        self.publish_control(&ControlMessage::BroadcastRaw { json: json.to_string() })
            .await
    }

    /// Sends a pre-serialized JSON chat component to one user.
    pub async fn send_raw_message_to_player(&self, player: &str, json: &str) -> Result<(), BridgeError> {
        self.targeted(ControlMessage::RawMessagePlayer {
            player: player.to_string(),
            json: json.to_string(),
        })
        .await
    }

    /// Disconnects a user from whichever front end holds them, showing
    /// `reason` as the kick message.
    pub async fn kick_player(&self, player: &str, reason: &str) -> Result<(), BridgeError> {
        self.targeted(ControlMessage::Kick {
            player: player.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    /// Runs a targeted command here when the user is local, else publishes it.
    async fn targeted(&self, command: ControlMessage) -> Result<(), BridgeError> {
        if command.execute(self.proxy.as_ref()).await? {
            return Ok(());
        }
        self.publish_control(&command).await
    }

    async fn publish_control(&self, command: &ControlMessage) -> Result<(), BridgeError> {
        let channel = self.keys.channel(command.kind());
        self.store.publish(&channel, &command.encode()).await?;
        debug!("📤 Published {:?} on {}", command.kind(), channel);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Presence of one user by id.
    pub async fn player(&self, id: PlayerId) -> Option<PresenceRecord> {
        self.registry.get(id).await
    }

    /// Presence of one user by display name, case-insensitive.
    pub async fn player_by_name(&self, name: &str) -> Option<PresenceRecord> {
        self.registry.get_by_name(name).await
    }

    /// Every user online in the cluster.
    pub async fn all_players(&self) -> Vec<PresenceRecord> {
        self.registry.all().await
    }

    /// Users connected through one front end.
    pub async fn players_on_front_end(&self, front_end: &InstanceId) -> Vec<PresenceRecord> {
        self.registry.all_on_front_end(front_end).await
    }

    /// Users currently routed to one backend, across all front ends.
    pub async fn players_on_backend(&self, backend: &str) -> Vec<PresenceRecord> {
        self.registry.all_on_backend(backend).await
    }

    /// Cluster-wide count for the server list ping.
    pub async fn online_count(&self) -> usize {
        self.registry.count_all().await
    }

    /// Cluster-wide count for one backend.
    pub async fn online_count_on(&self, backend: &str) -> usize {
        self.registry.count_on_backend(backend).await
    }

    /// `/vrb`-style status text for a user, or for the console when `None`.
    pub fn status_line(&self, viewer: Option<PlayerId>) -> String {
        let mut line = format!("ProxyID: {}", self.instance_id());
        if let Some(id) = viewer {
            let backend = self
                .proxy
                .local_players()
                .into_iter()
                .find(|p| p.id == id)
                .and_then(|p| p.backend)
                .unwrap_or_else(|| "None".to_string());
            line.push_str(&format!("\nServer: {}", backend));
        }
        line
    }

    // Component access for callers that need more than the shortcuts above.

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub fn player_view(&self) -> &Arc<PlayerViewCache> {
        &self.players
    }

    pub fn ip_view(&self) -> &Arc<IpViewCache> {
        &self.ips
    }

    pub fn bus(&self) -> &Arc<PubSubBus> {
        &self.bus
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyHandle> {
        &self.proxy
    }
}

// ============================================================================
// Session hooks
// ============================================================================

/// What the proxy should do with a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Allowed,
    /// Refuse the connection and show `reason` to the user.
    Denied { reason: String },
}

/// Registry side of the proxy's connection lifecycle.
pub struct SessionHooks {
    registry: Arc<PresenceRegistry>,
}

impl SessionHooks {
    /// Hooks writing through `registry`.
    pub fn new(registry: Arc<PresenceRegistry>) -> Self {
        Self { registry }
    }

    /// Claims the user's presence. Denied when the id is live elsewhere.
    pub async fn on_login(&self, player: &LocalPlayer) -> Result<LoginOutcome, BridgeError> {
        let record = LocalPlayer {
            backend: None,
            ..player.clone()
        }
        .to_record(self.registry.instance_id());

        if self.registry.register(record).await? {
            info!("👋 {} joined via {}", player.name, self.registry.instance_id());
            Ok(LoginOutcome::Allowed)
        } else {
            info!("🚫 Denied duplicate login for {}", player.name);
            Ok(LoginOutcome::Denied {
                reason: ALREADY_CONNECTED_REASON.to_string(),
            })
        }
    }

    /// Records the backend the user just connected to, creating the record
    /// when the registry lost it.
    pub async fn on_backend_switch(&self, player: &LocalPlayer, backend: &str) -> Result<(), BridgeError> {
        let record = match self.registry.get(player.id).await {
            Some(existing) => existing.with_backend(Some(backend.to_string())),
            None => LocalPlayer {
                backend: Some(backend.to_string()),
                ..player.clone()
            }
            .to_record(self.registry.instance_id()),
        };
        self.registry.update(record).await
    }

    /// Unregisters the user if this front end still owns them.
    pub async fn on_disconnect(&self, player: PlayerId) -> Result<bool, BridgeError> {
        self.registry.unregister_if_owned(player).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ChannelKind;
    use crate::store::MemoryStore;
    use crate::test_support::RecordingProxy;
    use crate::types::MessageBody;
    use futures::StreamExt;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        proxy: Arc<RecordingProxy>,
        api: ClusterApi,
        hooks: SessionHooks,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySchema::default();
        let id = InstanceId::new("AAAAAAAA").unwrap();
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            keys.clone(),
            id.clone(),
            Duration::from_secs(600),
        ));
        let proxy = Arc::new(RecordingProxy::new(&["lobby", "survival"]));
        let api = ClusterApi::new(
            store.clone(),
            keys.clone(),
            registry.clone(),
            Arc::new(PlayerViewCache::new(store.clone(), keys.clone())),
            Arc::new(IpViewCache::new(store.clone(), keys.clone())),
            Arc::new(PubSubBus::new(store.clone(), keys, id)),
            proxy.clone(),
        );
        Fixture {
            store,
            proxy,
            api,
            hooks: SessionHooks::new(registry),
        }
    }

    #[tokio::test]
    async fn test_local_player_is_moved_without_publishing() {
        let f = fixture();
        let keys = KeySchema::default();
        let mut sub = f.store.psubscribe(&keys.subscribe_pattern()).await.unwrap();
        let alice = f.proxy.connect("Alice", Some("lobby"));

        f.api.send_player("alice", "survival").await.unwrap();
        assert_eq!(f.proxy.moves(), vec![(alice, "survival".to_string())]);

        f.api.send_player("Remote", "survival").await.unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.channel, keys.channel(ChannelKind::SendRequest));
        assert_eq!(msg.payload, "Remote:survival");
    }

    #[tokio::test]
    async fn test_unknown_backend_for_local_player_is_an_error() {
        let f = fixture();
        f.proxy.connect("Alice", Some("lobby"));
        assert!(f.api.send_player("Alice", "nowhere").await.is_err());
    }

    #[tokio::test]
    async fn test_broadcasts_always_go_through_the_store() {
        let f = fixture();
        let keys = KeySchema::default();
        let mut sub = f.store.psubscribe(&keys.subscribe_pattern()).await.unwrap();

        f.api.send_message_to_all("restart soon").await.unwrap();
        f.api.send_raw_message_to_all(r#"{"text":"hi"}"#).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.channel, keys.channel(ChannelKind::SendMessageToAll));
        assert_eq!(first.payload, "restart soon");
        let second = sub.next().await.unwrap();
        assert_eq!(second.channel, keys.channel(ChannelKind::SendRawMessageToAll));
        assert!(f.proxy.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_messages_and_kicks_for_local_players() {
        let f = fixture();
        let bob = f.proxy.connect("Bob", None);

        f.api.send_message_to_player("Bob", "hi").await.unwrap();
        f.api.send_raw_message_to_player("Bob", r#"{"text":"hi"}"#).await.unwrap();
        f.api.kick_player("Bob", "bye").await.unwrap();

        assert_eq!(
            f.proxy.messages(),
            vec![
                (bob, MessageBody::Plain("hi".to_string())),
                (bob, MessageBody::Raw(r#"{"text":"hi"}"#.to_string()))
            ]
        );
        assert_eq!(f.proxy.kicks(), vec![(bob, "bye".to_string())]);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let f = fixture();
        let id = f.proxy.connect("Alice", None);
        let player = f.proxy.find_local("Alice").unwrap();
        assert_eq!(player.id, id);

        assert_eq!(f.hooks.on_login(&player).await.unwrap(), LoginOutcome::Allowed);
        assert!(matches!(f.hooks.on_login(&player).await.unwrap(), LoginOutcome::Denied { .. }));

        f.hooks.on_backend_switch(&player, "lobby").await.unwrap();
        assert_eq!(f.api.player(id).await.unwrap().backend.as_deref(), Some("lobby"));
        assert_eq!(f.api.online_count_on("lobby").await, 1);

        assert!(f.hooks.on_disconnect(id).await.unwrap());
        assert!(f.api.player(id).await.is_none());
        assert_eq!(f.api.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_backend_switch_recreates_missing_record() {
        let f = fixture();
        f.proxy.connect("Carol", None);
        let player = f.proxy.find_local("Carol").unwrap();

        f.hooks.on_backend_switch(&player, "survival").await.unwrap();
        let record = f.api.player_by_name("carol").await.unwrap();
        assert_eq!(record.backend.as_deref(), Some("survival"));
        assert_eq!(record.front_end, Some(InstanceId::new("AAAAAAAA").unwrap()));
    }

    #[tokio::test]
    async fn test_status_line() {
        let f = fixture();
        let id = f.proxy.connect("Alice", Some("lobby"));
        assert_eq!(f.api.status_line(None), "ProxyID: AAAAAAAA");
        assert_eq!(f.api.status_line(Some(id)), "ProxyID: AAAAAAAA\nServer: lobby");
        assert_eq!(
            f.api.status_line(Some(PlayerId::new())),
            "ProxyID: AAAAAAAA\nServer: None"
        );
    }
}
