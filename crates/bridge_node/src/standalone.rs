//! Proxy adapter for a node that holds no user connections.
//!
//! The node still joins the cluster, answers queries and sees every control
//! message, but never owns a user, so targeted commands always fall through
//! to whichever front end does.

use async_trait::async_trait;
use presence_bridge::{LocalPlayer, MessageBody, PlayerId, ProxyError, ProxyHandle};
use tracing::info;

/// Reports the configured backends and no connected users.
pub struct StandaloneProxy {
    backends: Vec<String>,
}

impl StandaloneProxy {
    pub fn new(backends: Vec<String>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl ProxyHandle for StandaloneProxy {
    fn local_players(&self) -> Vec<LocalPlayer> {
        Vec::new()
    }

    fn find_local(&self, _name: &str) -> Option<LocalPlayer> {
        None
    }

    fn backend_names(&self) -> Vec<String> {
        self.backends.clone()
    }

    async fn connect_to_backend(&self, player: PlayerId, _backend: &str) -> Result<(), ProxyError> {
        Err(ProxyError::NotConnected(player.to_string()))
    }

    async fn send_message(&self, player: PlayerId, _body: MessageBody) -> Result<(), ProxyError> {
        Err(ProxyError::NotConnected(player.to_string()))
    }

    /// Cluster-wide announcements are logged.
    async fn broadcast(&self, body: MessageBody) -> Result<(), ProxyError> {
        match body {
            MessageBody::Plain(text) => info!("📢 Broadcast: {}", text),
            MessageBody::Raw(json) => info!("📢 Raw broadcast: {}", json),
        }
        Ok(())
    }

    async fn disconnect(&self, player: PlayerId, _reason: &str) -> Result<(), ProxyError> {
        Err(ProxyError::NotConnected(player.to_string()))
    }
}
