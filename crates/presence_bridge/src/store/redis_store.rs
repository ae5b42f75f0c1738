//! Redis implementation of [`Store`].

use super::{ttl_secs, MessageStream, Store, StoreMessage};
use crate::config::{Credentials, StoreSettings};
use crate::error::{BridgeError, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCAN_BATCH: usize = 500;

/// Commands share one multiplexed [`ConnectionManager`]; each call works on
/// its own clone so a failed command never poisons another caller's handle.
/// Subscriptions get a dedicated connection each.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Validates credentials, then opens the command connection.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, BridgeError> {
        let credentials = settings.credentials()?;
        let info = connection_info(&settings.hostname, settings.port, &credentials)
            .map_err(StoreError::from)?;
        let timeout = settings.timeout();

        let client = redis::Client::open(info).map_err(StoreError::from)?;
        let manager = match tokio::time::timeout(timeout, ConnectionManager::new(client.clone())).await {
            Ok(result) => result.map_err(StoreError::from)?,
            Err(_) => return Err(StoreError::Timeout(timeout).into()),
        };

        info!(
            "🔗 Connected to store at {}:{} ({})",
            settings.hostname,
            settings.port,
            match credentials {
                Credentials::None => "no auth",
                Credentials::Password(_) => "password auth",
                Credentials::UserPassword { .. } => "ACL auth",
            }
        );

        Ok(Self { client, manager, timeout })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        self.bounded(redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = self.bounded(redis::cmd("DEL").arg(key).query_async(&mut conn)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let applied: i64 = self
            .bounded(redis::cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).query_async(&mut conn))
            .await?;
        Ok(applied == 1)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across iterations
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        self.bounded(redis::cmd("HGETALL").arg(key).query_async(&mut conn)).await
    }

    async fn replace_hash(
        &self,
        key: &str,
        entries: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !entries.is_empty() {
            pipe.cmd("HSET").arg(key);
            for (field, value) in entries {
                pipe.arg(field).arg(value);
            }
            pipe.ignore();
            pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();
        }
        self.bounded(pipe.query_async::<()>(&mut conn)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let receivers: i64 = self
            .bounded(redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut conn))
            .await?;
        debug!("📤 Published on {} to {} receivers", channel, receivers);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, StoreError> {
        let mut pubsub = self.bounded(self.client.get_async_pubsub()).await?;
        self.bounded(pubsub.psubscribe(pattern)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage { channel, payload }),
                Err(e) => {
                    warn!("⚠️ Dropping non-text payload on {}: {}", channel, e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Connection parameters for a plain TCP connection. Credentials go straight
/// into the handshake settings, so no URL escaping is involved.
fn connection_info(host: &str, port: u16, credentials: &Credentials) -> redis::RedisResult<ConnectionInfo> {
    let redis_settings = match credentials {
        Credentials::None => RedisConnectionInfo::default(),
        Credentials::Password(password) => RedisConnectionInfo::default().set_password(password),
        Credentials::UserPassword { username, password } => RedisConnectionInfo::default()
            .set_username(username)
            .set_password(password),
    };
    Ok(ConnectionAddr::Tcp(host.to_string(), port)
        .into_connection_info()?
        .set_redis_settings(redis_settings))
}
