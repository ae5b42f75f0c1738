//! Materialized views over the per-front-end roster hashes.
//!
//! Every front end periodically writes which of its users sit on which
//! backend (and from which address) into hashes keyed by front end and
//! backend. The caches here scan those hashes and publish a read-only
//! snapshot. A rebuild swaps the whole snapshot in one step, so readers see
//! either the old cluster picture or the new one and nothing in between.

use crate::error::StoreError;
use crate::keys::{KeySchema, PlayersKey};
use crate::store::Store;
use crate::types::{HostPort, InstanceId, LocalPlayer, PlayerId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ============================================================================
// Player view
// ============================================================================

/// Cluster-wide roster as of the last rebuild.
#[derive(Debug, Default)]
pub struct PlayerSnapshot {
    players: HashMap<PlayerId, String>,
    by_backend: HashMap<String, HashSet<PlayerId>>,
    by_front_end: HashMap<String, HashSet<PlayerId>>,
    names: OnceLock<HashMap<String, PlayerId>>,
}

impl PlayerSnapshot {
    /// Users listed in any roster hash.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Users listed under `backend` by any front end.
    pub fn player_count_on(&self, backend: &str) -> usize {
        self.by_backend.get(backend).map_or(0, HashSet::len)
    }

    /// Display name as last written by the user's front end.
    pub fn name_of(&self, id: &PlayerId) -> Option<&str> {
        self.players.get(id).map(String::as_str)
    }

    /// Reverse lookup, built on first use and kept for this snapshot's lifetime.
    pub fn id_of(&self, name: &str) -> Option<PlayerId> {
        let names = self.names.get_or_init(|| {
            self.players
                .iter()
                .map(|(id, name)| (name.to_ascii_lowercase(), *id))
                .collect()
        });
        names.get(&name.to_ascii_lowercase()).copied()
    }

    /// Id to display name for every listed user.
    pub fn players(&self) -> &HashMap<PlayerId, String> {
        &self.players
    }

    /// Ids on one backend, across all front ends.
    pub fn on_backend(&self, backend: &str) -> Vec<PlayerId> {
        self.by_backend
            .get(backend)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids published by one front end. Takes the raw id text from the key,
    /// so hashes from peers with unusual ids are still reachable.
    pub fn on_front_end(&self, front_end: &str) -> Vec<PlayerId> {
        self.by_front_end
            .get(front_end)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Backend names with at least one listed user, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_backend.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Periodically rebuilt view over every front end's roster hashes.
///
/// Unlike [`PresenceRegistry`](crate::registry::PresenceRegistry) this view
/// is not updated per event. It is as fresh as the last
/// [`rebuild`](Self::rebuild), which the runtime runs on the cache update
/// interval.
///
/// # Examples
///
/// ```rust,ignore
/// let view = PlayerViewCache::new(store, KeySchema::default());
/// view.rebuild().await?;
///
/// let snapshot = view.snapshot().await;
/// for backend in snapshot.backends() {
///     println!("{}: {}", backend, snapshot.player_count_on(&backend));
/// }
/// ```
pub struct PlayerViewCache {
    store: Arc<dyn Store>,
    keys: KeySchema,
    snapshot: RwLock<Arc<PlayerSnapshot>>,
}

impl PlayerViewCache {
    /// Creates a view with an empty snapshot. Nothing is read until the
    /// first rebuild.
    pub fn new(store: Arc<dyn Store>, keys: KeySchema) -> Self {
        Self {
            store,
            keys,
            snapshot: RwLock::new(Arc::new(PlayerSnapshot::default())),
        }
    }

    /// Scans every roster hash and swaps in the result. On a store failure
    /// the previous snapshot stays in place.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let keys = self.store.scan_keys(&self.keys.players_pattern()).await?;
        let mut next = PlayerSnapshot::default();

        for key in keys {
            let Some(PlayersKey::Roster { front_end, backend }) = self.keys.classify_players_key(&key)
            else {
                continue;
            };
            let roster = self.store.hash_get_all(&key).await?;
            for (raw_id, name) in roster {
                let Ok(id) = PlayerId::parse(&raw_id) else {
                    warn!(key = %key, "⚠️ Skipping roster entry with bad id '{}'", raw_id);
                    continue;
                };
                next.players.insert(id, name);
                next.by_backend.entry(backend.clone()).or_default().insert(id);
                next.by_front_end.entry(front_end.clone()).or_default().insert(id);
            }
        }

        let count = next.players.len();
        *self.snapshot.write().await = Arc::new(next);
        debug!("🗺️ Player view rebuilt with {} player(s)", count);
        Ok(count)
    }

    /// Current snapshot. Holding it never blocks a rebuild.
    pub async fn snapshot(&self) -> Arc<PlayerSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Shorthand for `snapshot().await.player_count()`.
    pub async fn player_count(&self) -> usize {
        self.snapshot().await.player_count()
    }

    pub async fn player_count_on(&self, backend: &str) -> usize {
        self.snapshot().await.player_count_on(backend)
    }

    /// Case-insensitive name lookup against the current snapshot.
    pub async fn uuid_from_name(&self, name: &str) -> Option<PlayerId> {
        self.snapshot().await.id_of(name)
    }
}

// ============================================================================
// IP view
// ============================================================================

/// Remote address of every user, as published by their front end.
#[derive(Debug, Default)]
pub struct IpSnapshot {
    addresses: HashMap<PlayerId, HostPort>,
}

impl IpSnapshot {
    /// Address of one user, if any front end published it.
    pub fn get(&self, id: &PlayerId) -> Option<&HostPort> {
        self.addresses.get(id)
    }

    /// Every published address keyed by user.
    pub fn all(&self) -> &HashMap<PlayerId, HostPort> {
        &self.addresses
    }
}

/// Periodically rebuilt view over the `<prefix>:ip:*` hashes.
///
/// Answers address lookups for users connected through other front ends,
/// for instance the `IPOther` plugin message. Entries that fail to parse
/// are skipped with a warning instead of failing the rebuild.
pub struct IpViewCache {
    store: Arc<dyn Store>,
    keys: KeySchema,
    snapshot: RwLock<Arc<IpSnapshot>>,
}

impl IpViewCache {
    /// Creates a view with an empty snapshot.
    pub fn new(store: Arc<dyn Store>, keys: KeySchema) -> Self {
        Self {
            store,
            keys,
            snapshot: RwLock::new(Arc::new(IpSnapshot::default())),
        }
    }

    /// Scans every IP hash and swaps in the result.
    ///
    /// # Returns
    ///
    /// The number of addresses in the new snapshot. On a store failure the
    /// previous snapshot stays in place and the error is returned.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let keys = self.store.scan_keys(&self.keys.ip_pattern()).await?;
        let mut next = IpSnapshot::default();

        for key in keys {
            if self.keys.parse_ip_key(&key).is_none() {
                continue;
            }
            for (raw_id, raw_addr) in self.store.hash_get_all(&key).await? {
                match (PlayerId::parse(&raw_id), HostPort::parse(&raw_addr)) {
                    (Ok(id), Some(addr)) => {
                        next.addresses.insert(id, addr);
                    }
                    _ => warn!(key = %key, "⚠️ Skipping malformed IP entry {} = {}", raw_id, raw_addr),
                }
            }
        }

        let count = next.addresses.len();
        *self.snapshot.write().await = Arc::new(next);
        debug!("🗺️ IP view rebuilt with {} address(es)", count);
        Ok(count)
    }

    /// Current snapshot, shared rather than copied.
    pub async fn snapshot(&self) -> Arc<IpSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Address of one user from the current snapshot.
    pub async fn get_ip(&self, id: &PlayerId) -> Option<HostPort> {
        self.snapshot().await.get(id).cloned()
    }

    /// Owned copy of every address. Prefer [`snapshot`](Self::snapshot) when
    /// a borrow is enough.
    pub async fn get_all_ip(&self) -> HashMap<PlayerId, HostPort> {
        self.snapshot().await.all().clone()
    }
}

// ============================================================================
// Roster producer
// ============================================================================

/// Writes this front end's share of the roster and IP hashes.
pub struct RosterPublisher {
    store: Arc<dyn Store>,
    keys: KeySchema,
    instance_id: InstanceId,
    ttl: Duration,
}

impl RosterPublisher {
    /// # Arguments
    ///
    /// * `instance_id` - Front end segment of every key written
    /// * `ttl` - Expiry of the hashes, so a dead front end's rosters decay
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, instance_id: InstanceId, ttl: Duration) -> Self {
        Self { store, keys, instance_id, ttl }
    }

    /// Replaces the hashes of every known backend. Backends left without
    /// users get their keys removed so departed users do not linger.
    pub async fn publish(&self, backends: &[String], local: &[LocalPlayer]) -> Result<(), StoreError> {
        let mut rosters: HashMap<&str, HashMap<String, String>> = HashMap::new();
        let mut addresses: HashMap<&str, HashMap<String, String>> = HashMap::new();
        for backend in backends {
            rosters.entry(backend.as_str()).or_default();
            addresses.entry(backend.as_str()).or_default();
        }
        for player in local {
            let Some(backend) = player.backend.as_deref() else {
                continue;
            };
            rosters
                .entry(backend)
                .or_default()
                .insert(player.id.to_string(), player.name.clone());
            addresses
                .entry(backend)
                .or_default()
                .insert(player.id.to_string(), HostPort::from(player.remote).to_string());
        }

        for (backend, entries) in &rosters {
            let key = self.keys.roster(&self.instance_id, backend);
            self.store.replace_hash(&key, entries, self.ttl).await?;
        }
        for (backend, entries) in &addresses {
            let key = self.keys.ip_roster(&self.instance_id, backend);
            self.store.replace_hash(&key, entries, self.ttl).await?;
        }
        Ok(())
    }
}
