//! Instance identity leasing.
//!
//! Each front end claims `<prefix>:serverid:<id>` with set-if-absent and keeps
//! renewing its TTL while alive. There is no release call: a dead instance's
//! id becomes free once the lease lapses.

use crate::error::{BridgeError, StoreError};
use crate::keys::KeySchema;
use crate::store::Store;
use crate::types::InstanceId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LEASE_VALUE: &str = "using";

/// Claims and keeps this front end's cluster-unique id.
///
/// # Examples
///
/// ```rust,ignore
/// let leaser = Arc::new(InstanceIdentityLeaser::new(store, keys, Duration::from_secs(600)));
/// let id = leaser.claim().await?;
/// let renewal = leaser.clone().spawn_renewal(id.clone(), Duration::from_secs(300), shutdown_rx);
/// ```
pub struct InstanceIdentityLeaser {
    store: Arc<dyn Store>,
    keys: KeySchema,
    lease: Duration,
}

impl InstanceIdentityLeaser {
    /// `lease` is the TTL written on claim and on every renewal. It must
    /// outlast the renewal period.
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, lease: Duration) -> Self {
        Self { store, keys, lease }
    }

    /// Claims a fresh id, drawing new candidates until one is free.
    ///
    /// Any store failure is returned immediately: without an id the instance
    /// cannot join the cluster.
    pub async fn claim(&self) -> Result<InstanceId, BridgeError> {
        self.claim_with(InstanceId::random).await
    }

    pub(crate) async fn claim_with(
        &self,
        mut next_candidate: impl FnMut() -> InstanceId + Send,
    ) -> Result<InstanceId, BridgeError> {
        let mut attempts: u64 = 0;
        loop {
            let candidate = next_candidate();
            attempts += 1;
            let key = self.keys.server_id(&candidate);
            if self.store.set_if_absent(&key, LEASE_VALUE, self.lease).await? {
                info!("🆔 Claimed instance id {} after {} attempt(s)", candidate, attempts);
                return Ok(candidate);
            }
            debug!("Instance id {} already leased, drawing another", candidate);
        }
    }

    /// Re-applies the lease TTL once. A lapsed lease is re-taken for the same
    /// id when nobody else grabbed it in the meantime.
    pub async fn renew(&self, id: &InstanceId) -> Result<(), StoreError> {
        let key = self.keys.server_id(id);
        if self.store.expire(&key, self.lease).await? {
            debug!("🔄 Renewed instance id lease for {}", id);
            return Ok(());
        }
        warn!("⚠️ Instance id lease for {} had lapsed, re-claiming", id);
        if self.store.set_if_absent(&key, LEASE_VALUE, self.lease).await? {
            info!("🆔 Re-claimed instance id {}", id);
        } else {
            error!(
                "❌ Instance id {} is now leased by another front end; cluster state may be ambiguous",
                id
            );
        }
        Ok(())
    }

    /// Renews the lease every `period` until shutdown is signalled.
    pub fn spawn_renewal(
        self: Arc<Self>,
        id: InstanceId,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.renew(&id).await {
                            warn!("⚠️ Lease renewal for {} skipped: {}", id, e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
