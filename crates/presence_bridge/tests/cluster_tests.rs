//! Cross-instance scenarios
//!
//! Two front ends share one in-process store and talk to each other only
//! through it, exactly as they would through a real deployment.

use async_trait::async_trait;
use presence_bridge::{
    BridgeConfig, BridgeContext, LocalPlayer, LoginOutcome, MemoryStore, MessageBody, PlayerId,
    ProxyError, ProxyHandle, RunnerState, Store,
};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};

/// Proxy double that keeps its users in memory and records what it was asked to do.
#[derive(Default)]
struct FakeProxy {
    backends: Vec<String>,
    players: Mutex<Vec<LocalPlayer>>,
    moves: Mutex<Vec<(PlayerId, String)>>,
    broadcasts: Mutex<Vec<MessageBody>>,
}

impl FakeProxy {
    fn new(backends: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            backends: backends.iter().map(|b| b.to_string()).collect(),
            ..Default::default()
        })
    }

    fn join(&self, player: &LocalPlayer) {
        self.players.lock().unwrap().push(player.clone());
    }

    fn leave(&self, id: PlayerId) {
        self.players.lock().unwrap().retain(|p| p.id != id);
    }
}

#[async_trait]
impl ProxyHandle for FakeProxy {
    fn local_players(&self) -> Vec<LocalPlayer> {
        self.players.lock().unwrap().clone()
    }

    fn find_local(&self, name: &str) -> Option<LocalPlayer> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn backend_names(&self) -> Vec<String> {
        self.backends.clone()
    }

    async fn connect_to_backend(&self, player: PlayerId, backend: &str) -> Result<(), ProxyError> {
        self.moves.lock().unwrap().push((player, backend.to_string()));
        Ok(())
    }

    async fn send_message(&self, _player: PlayerId, _body: MessageBody) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn broadcast(&self, body: MessageBody) -> Result<(), ProxyError> {
        self.broadcasts.lock().unwrap().push(body);
        Ok(())
    }

    async fn disconnect(&self, player: PlayerId, _reason: &str) -> Result<(), ProxyError> {
        self.leave(player);
        Ok(())
    }
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        reconnect_delay_ms: 20,
        reconnect_budget: 5,
        ..BridgeConfig::default()
    }
}

fn player(name: &str, port: u16) -> LocalPlayer {
    LocalPlayer {
        id: PlayerId::new(),
        name: name.to_string(),
        remote: format!("192.168.1.10:{}", port).parse().unwrap(),
        backend: None,
    }
}

async fn start(store: &Arc<MemoryStore>, proxy: &Arc<FakeProxy>) -> BridgeContext {
    let ctx = BridgeContext::start(test_config(), store.clone(), proxy.clone())
        .await
        .expect("bridge should start");
    let mut state = ctx.runner_state();
    timeout(Duration::from_secs(2), state.wait_for(|s| *s == RunnerState::Subscribed))
        .await
        .expect("runner did not subscribe in time")
        .expect("runner dropped");
    ctx
}

/// Polls a condition until it holds or two seconds pass.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let reached = timeout(Duration::from_secs(2), async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {}", $what);
    }};
}

#[tokio::test(flavor = "multi_thread")]
async fn test_presence_changes_propagate_between_front_ends() {
    let store = Arc::new(MemoryStore::new());
    let proxy_a = FakeProxy::new(&["lobby", "survival"]);
    let proxy_b = FakeProxy::new(&["lobby", "survival"]);
    let a = start(&store, &proxy_a).await;
    let b = start(&store, &proxy_b).await;
    assert_ne!(a.instance_id(), b.instance_id());

    let alice = player("Alice", 50001);
    proxy_a.join(&alice);
    assert_eq!(a.hooks().on_login(&alice).await.unwrap(), LoginOutcome::Allowed);

    eventually!("B to see the login", b.api().player(alice.id).await.is_some());
    let seen = b.api().player_by_name("ALICE").await.unwrap();
    assert_eq!(seen.front_end.as_ref(), Some(a.instance_id()));
    assert_eq!(seen.backend, None);

    a.hooks().on_backend_switch(&alice, "survival").await.unwrap();
    eventually!("B to see the backend switch", b.api().online_count_on("survival").await == 1);
    assert_eq!(b.api().players_on_front_end(a.instance_id()).await.len(), 1);

    assert!(a.hooks().on_disconnect(alice.id).await.unwrap());
    eventually!("B to see the logout", b.api().player(alice.id).await.is_none());
    assert_eq!(b.api().online_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
    println!("✅ Presence propagated through register, update and unregister");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_logins_have_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let proxy_a = FakeProxy::new(&["lobby"]);
    let proxy_b = FakeProxy::new(&["lobby"]);
    let a = start(&store, &proxy_a).await;
    let b = start(&store, &proxy_b).await;

    let bob = player("Bob", 50002);
    let (first, second) = tokio::join!(a.hooks().on_login(&bob), b.hooks().on_login(&bob));
    let outcomes = [first.unwrap(), second.unwrap()];
    let allowed = outcomes.iter().filter(|o| **o == LoginOutcome::Allowed).count();
    assert_eq!(allowed, 1, "exactly one front end may own the user: {:?}", outcomes);

    let owner = if outcomes[0] == LoginOutcome::Allowed { &a } else { &b };
    let record = owner.api().player(bob.id).await.unwrap();
    assert_eq!(record.front_end.as_ref(), Some(owner.instance_id()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bus_message_skips_its_publisher() {
    let store = Arc::new(MemoryStore::new());
    let a = start(&store, &FakeProxy::new(&[])).await;
    let b = start(&store, &FakeProxy::new(&[])).await;

    let seen_a = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_b = Arc::new(Mutex::new(Vec::<String>::new()));
    for (ctx, seen) in [(&a, &seen_a), (&b, &seen_b)] {
        let seen = seen.clone();
        ctx.api().bus().on("chat", move |payload| {
            seen.lock().unwrap().push(payload.to_string());
            Ok(())
        });
    }

    a.api().bus().publish("chat", "hello from A", false).await.unwrap();
    eventually!("B to receive the chat message", seen_b.lock().unwrap().len() == 1);

    a.api().bus().publish("chat", "everyone", true).await.unwrap();
    eventually!(
        "both to receive the self-inclusive message",
        seen_a.lock().unwrap().len() == 1 && seen_b.lock().unwrap().len() == 2
    );

    assert_eq!(*seen_a.lock().unwrap(), vec!["everyone".to_string()]);
    assert_eq!(a.api().bus().stats().self_filtered, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_send_request_is_executed_by_owner() {
    let store = Arc::new(MemoryStore::new());
    let proxy_a = FakeProxy::new(&["lobby", "survival"]);
    let proxy_b = FakeProxy::new(&["lobby", "survival"]);
    let a = start(&store, &proxy_a).await;
    let b = start(&store, &proxy_b).await;

    let carol = player("Carol", 50003);
    proxy_b.join(&carol);
    b.hooks().on_login(&carol).await.unwrap();

    a.api().send_player("carol", "survival").await.unwrap();
    eventually!("B to move Carol", !proxy_b.moves.lock().unwrap().is_empty());
    assert_eq!(*proxy_b.moves.lock().unwrap(), vec![(carol.id, "survival".to_string())]);
    assert!(proxy_a.moves.lock().unwrap().is_empty());

    a.api().send_message_to_all("restart in 5").await.unwrap();
    eventually!(
        "both front ends to broadcast",
        proxy_a.broadcasts.lock().unwrap().len() == 1 && proxy_b.broadcasts.lock().unwrap().len() == 1
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_after_missed_notifications() {
    let store = Arc::new(MemoryStore::new());
    let proxy_a = FakeProxy::new(&["lobby"]);
    let proxy_b = FakeProxy::new(&["lobby"]);
    let a = start(&store, &proxy_a).await;
    let b = start(&store, &proxy_b).await;

    // B is offline while A registers Dave, so B never sees the notification
    store.disconnect_subscribers();
    let dave = player("Dave", 50004);
    a.hooks().on_login(&dave).await.unwrap();

    eventually!("B to recover Dave after resubscribing", b.api().player(dave.id).await.is_some());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_leaves_identity_lease_to_expire() {
    let store = Arc::new(MemoryStore::new());
    let a = start(&store, &FakeProxy::new(&[])).await;
    let id = a.instance_id().clone();
    a.shutdown().await;

    let leases = store.scan_keys("velocity-redis-bridge:serverid:*").await.unwrap();
    assert_eq!(leases, vec![format!("velocity-redis-bridge:serverid:{}", id)]);
}
