//! Store-backed presence registry.
//!
//! The store holds the authoritative record for every connected user under
//! `<prefix>:players:<id>`. Each front end mirrors those records locally with
//! secondary indices so lookups never leave the process. Local copies are
//! kept current by the notifications every writer publishes, with
//! [`PresenceRegistry::fetch_full`] as the periodic backstop.
//!
//! Lock discipline: one lock guards all indices and is never held across a
//! store call.

use crate::error::{BridgeError, StoreError};
use crate::keys::{ChannelKind, KeySchema, PlayersKey};
use crate::store::Store;
use crate::types::{InstanceId, LocalPlayer, PlayerId, PresenceRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

// ============================================================================
// Local indices
// ============================================================================

#[derive(Debug, Default)]
struct RegistryIndex {
    by_id: HashMap<PlayerId, PresenceRecord>,
    /// Lowercased name to every id currently using it.
    by_name: HashMap<String, HashSet<PlayerId>>,
    by_front_end: HashMap<InstanceId, HashSet<PresenceRecord>>,
    by_backend: HashMap<String, HashSet<PresenceRecord>>,
    /// Present while a full fetch is in flight. Every record applied in the
    /// meantime is kept here and replayed onto the fetched index.
    journal: Option<Vec<PresenceRecord>>,
}

fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl RegistryIndex {
    /// Applies a record or tombstone. Returns whether anything changed.
    fn apply(&mut self, record: PresenceRecord) -> bool {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(record.clone());
        }
        if record.is_tombstone() {
            return self.remove(&record.id).is_some();
        }
        if let Some(existing) = self.by_id.get(&record.id) {
            if existing.same_contents(&record) {
                return false;
            }
        }
        self.remove(&record.id);
        self.insert(record);
        true
    }

    fn insert(&mut self, record: PresenceRecord) {
        self.by_name
            .entry(name_key(record.name()))
            .or_default()
            .insert(record.id);
        if let Some(front_end) = &record.front_end {
            self.by_front_end
                .entry(front_end.clone())
                .or_default()
                .insert(record.clone());
        }
        if let Some(backend) = &record.backend {
            self.by_backend
                .entry(backend.clone())
                .or_default()
                .insert(record.clone());
        }
        self.by_id.insert(record.id, record);
    }

    /// Removes a record from exactly the buckets its own fields point at.
    fn remove(&mut self, id: &PlayerId) -> Option<PresenceRecord> {
        let old = self.by_id.remove(id)?;

        let name = name_key(old.name());
        if let Some(ids) = self.by_name.get_mut(&name) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_name.remove(&name);
            }
        }
        if let Some(front_end) = &old.front_end {
            if let Some(bucket) = self.by_front_end.get_mut(front_end) {
                bucket.remove(&old);
                if bucket.is_empty() {
                    self.by_front_end.remove(front_end);
                }
            }
        }
        if let Some(backend) = &old.backend {
            if let Some(bucket) = self.by_backend.get_mut(backend) {
                bucket.remove(&old);
                if bucket.is_empty() {
                    self.by_backend.remove(backend);
                }
            }
        }
        Some(old)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Outcome of one [`PresenceRegistry::refresh_leases`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseRefresh {
    pub renewed: usize,
    pub reregistered: usize,
    /// Records that lapsed and were claimed by another front end before we could re-register.
    pub lost: usize,
}

/// Cluster-wide presence, mirrored locally.
///
/// Writes go to the store first and are then announced on the
/// `info-update-notify` channel so every peer can apply them through
/// [`receive_remote_notification`](Self::receive_remote_notification).
/// Reads never touch the store: they copy out of the local indices under a
/// read lock, so callers get owned snapshots they can keep.
///
/// # Examples
///
/// ```rust,ignore
/// let registry = PresenceRegistry::new(store, KeySchema::default(), instance_id.clone(), ttl);
/// registry.fetch_full().await?;
///
/// if !registry.register(player.to_record(&instance_id)).await? {
///     // already online somewhere else in the cluster
/// }
/// let on_lobby = registry.count_on_backend("lobby").await;
/// ```
pub struct PresenceRegistry {
    store: Arc<dyn Store>,
    keys: KeySchema,
    instance_id: InstanceId,
    ttl: Duration,
    index: RwLock<RegistryIndex>,
    /// Serializes full fetches so only one journal is ever open.
    fetch_gate: Mutex<()>,
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("instance_id", &self.instance_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PresenceRegistry {
    /// Creates an empty registry for one front end.
    ///
    /// # Arguments
    ///
    /// * `store` - Shared store holding the authoritative records
    /// * `keys` - Key layout of the cluster
    /// * `instance_id` - This front end's leased id, written as record owner
    /// * `ttl` - Expiry applied to every record this front end writes
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, instance_id: InstanceId, ttl: Duration) -> Self {
        Self {
            store,
            keys,
            instance_id,
            ttl,
            index: RwLock::new(RegistryIndex::default()),
            fetch_gate: Mutex::new(()),
        }
    }

    /// The front end this registry writes as.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Claims the store entry for a newly connected user.
    ///
    /// The claim is an atomic set-if-absent with the registry's TTL, so of two
    /// front ends racing for the same id exactly one wins. On success the
    /// record is applied locally and announced to peers.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when the claim succeeded. `Ok(false)` means another session already holds the id somewhere in
    /// the cluster; nothing is changed locally and the caller should deny
    /// the new session.
    pub async fn register(&self, record: PresenceRecord) -> Result<bool, BridgeError> {
        let json = serde_json::to_string(&record)?;
        let key = self.keys.presence(&record.id);
        if !self.store.set_if_absent(&key, &json, self.ttl).await? {
            debug!("Presence for {} already held elsewhere", record.id);
            return Ok(false);
        }

        self.index.write().await.apply(record);
        self.notify(&json).await;
        Ok(true)
    }

    /// Overwrites an existing record, e.g. after a backend switch.
    pub async fn update(&self, record: PresenceRecord) -> Result<(), BridgeError> {
        let json = serde_json::to_string(&record)?;
        let key = self.keys.presence(&record.id);
        self.store.set_with_expiry(&key, &json, self.ttl).await?;

        self.index.write().await.apply(record);
        self.notify(&json).await;
        Ok(())
    }

    /// Deletes a user's record and tells every peer to evict it.
    ///
    /// Ownership is not checked; see
    /// [`unregister_if_owned`](Self::unregister_if_owned) for disconnect
    /// handling.
    pub async fn unregister(&self, id: PlayerId) -> Result<(), BridgeError> {
        self.store.delete(&self.keys.presence(&id)).await?;

        let tombstone = PresenceRecord::tombstone(id);
        let json = serde_json::to_string(&tombstone)?;
        self.index.write().await.apply(tombstone);
        self.notify(&json).await;
        Ok(())
    }

    /// Unregisters only when this front end owns the record. A disconnect
    /// reported by a front end that lost ownership must not evict the newer
    /// session. Falls back to the store copy when the local index has no entry.
    pub async fn unregister_if_owned(&self, id: PlayerId) -> Result<bool, BridgeError> {
        let local = self.get(id).await;
        let owner = match local {
            Some(record) => record.front_end,
            None => match self.store.get(&self.keys.presence(&id)).await? {
                Some(json) => serde_json::from_str::<PresenceRecord>(&json)
                    .ok()
                    .and_then(|r| r.front_end),
                None => None,
            },
        };

        if owner.as_ref() != Some(&self.instance_id) {
            debug!("Ignoring disconnect of {}: owned by {:?}", id, owner);
            return Ok(false);
        }
        self.unregister(id).await?;
        Ok(true)
    }

    /// Applies a peer's notification without touching the store.
    /// Returns whether the local state changed.
    pub async fn receive_remote_notification(&self, record: PresenceRecord) -> bool {
        self.index.write().await.apply(record)
    }

    /// Re-asserts the TTL of every record this front end owns, re-registering
    /// any that lapsed. A store failure aborts the pass; the next tick retries.
    pub async fn refresh_leases(&self, local: &[LocalPlayer]) -> Result<LeaseRefresh, StoreError> {
        let mut outcome = LeaseRefresh::default();
        for player in local {
            let key = self.keys.presence(&player.id);
            if self.store.expire(&key, self.ttl).await? {
                outcome.renewed += 1;
                continue;
            }

            let record = player.to_record(&self.instance_id);
            match self.register(record).await {
                Ok(true) => {
                    info!("♻️ Re-registered lapsed presence for {}", player.name);
                    outcome.reregistered += 1;
                }
                Ok(false) => {
                    warn!("⚠️ Presence for {} lapsed and was claimed elsewhere", player.name);
                    outcome.lost += 1;
                }
                Err(BridgeError::Store(e)) => return Err(e),
                Err(e) => warn!("⚠️ Could not re-register {}: {}", player.name, e),
            }
        }
        Ok(outcome)
    }

    /// Rebuilds every local index from the store.
    ///
    /// The store is scanned without holding the index lock. Mutations that
    /// land during the scan (local writes as well as peer notifications) are
    /// journaled and replayed onto the fetched index before it is swapped
    /// in, so a user unregistered mid-fetch stays gone.
    ///
    /// # Returns
    ///
    /// The number of records in the index after the swap. On a store error
    /// the current index is kept unchanged.
    pub async fn fetch_full(&self) -> Result<usize, StoreError> {
        let _gate = self.fetch_gate.lock().await;
        self.index.write().await.journal = Some(Vec::new());

        let loaded = self.load_from_store().await;

        let mut index = self.index.write().await;
        let journal = index.journal.take().unwrap_or_default();
        let mut fresh = loaded?;
        let replayed = journal.len();
        for record in journal {
            fresh.apply(record);
        }
        let count = fresh.by_id.len();
        *index = fresh;
        drop(index);

        debug!(
            "📥 Full presence fetch loaded {} record(s), {} replayed from concurrent changes",
            count, replayed
        );
        Ok(count)
    }

    async fn load_from_store(&self) -> Result<RegistryIndex, StoreError> {
        let keys = self.store.scan_keys(&self.keys.players_pattern()).await?;

        let mut fresh = RegistryIndex::default();
        for key in keys {
            if !matches!(self.keys.classify_players_key(&key), Some(PlayersKey::Presence(_))) {
                continue;
            }
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<PresenceRecord>(&json) {
                Ok(record) if !record.is_tombstone() => {
                    fresh.apply(record);
                }
                Ok(_) => {}
                Err(e) => warn!(key = %key, "⚠️ Skipping malformed presence record: {}", e),
            }
        }
        Ok(fresh)
    }

    async fn notify(&self, json: &str) {
        let channel = self.keys.channel(ChannelKind::InfoUpdateNotify);
        if let Err(e) = self.store.publish(&channel, json).await {
            warn!("⚠️ Presence notification not published, peers will catch up on full fetch: {}", e);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Looks up one user by id.
    pub async fn get(&self, id: PlayerId) -> Option<PresenceRecord> {
        self.index.read().await.by_id.get(&id).cloned()
    }

    /// Looks up one user by display name.
    ///
    /// Case-insensitive, like the proxy's own name lookups. When several
    /// users share a name up to case, the one spelled exactly like `name`
    /// is preferred.
    pub async fn get_by_name(&self, name: &str) -> Option<PresenceRecord> {
        let index = self.index.read().await;
        let ids = index.by_name.get(&name_key(name))?;
        // an exact-case match wins over other spellings of the same name
        ids.iter()
            .filter_map(|id| index.by_id.get(id))
            .find(|record| record.name() == name)
            .or_else(|| ids.iter().find_map(|id| index.by_id.get(id)))
            .cloned()
    }

    /// Number of users online anywhere in the cluster.
    pub async fn count_all(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    /// Number of users currently routed to `backend`. Zero for unknown names.
    pub async fn count_on_backend(&self, backend: &str) -> usize {
        self.index
            .read()
            .await
            .by_backend
            .get(backend)
            .map_or(0, HashSet::len)
    }

    /// Every user connected through one front end, in no particular order.
    pub async fn all_on_front_end(&self, front_end: &InstanceId) -> Vec<PresenceRecord> {
        self.index
            .read()
            .await
            .by_front_end
            .get(front_end)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every user routed to one backend, in no particular order.
    pub async fn all_on_backend(&self, backend: &str) -> Vec<PresenceRecord> {
        self.index
            .read()
            .await
            .by_backend
            .get(backend)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of every known record.
    pub async fn all(&self) -> Vec<PresenceRecord> {
        self.index.read().await.by_id.values().cloned().collect()
    }

    /// Backends with at least one user on them.
    pub async fn occupied_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.read().await.by_backend.keys().cloned().collect();
        names.sort();
        names
    }
}
