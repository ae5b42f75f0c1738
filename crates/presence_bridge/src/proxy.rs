//! The boundary to the proxy that actually owns user connections.
//!
//! The bridge never opens a backend connection itself. Whenever a cluster
//! command targets a user on this front end it asks the proxy through this
//! trait.

use crate::error::ProxyError;
use crate::types::{LocalPlayer, MessageBody, PlayerId};
use async_trait::async_trait;

/// What the bridge needs from the proxy it runs inside.
///
/// The sync methods are called from async code and must not block; they
/// are expected to read the proxy's own connection table. Every async
/// method reports [`ProxyError::NotConnected`] when the user is not on
/// this front end, which lets a command fall through to its owner.
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// Every user currently connected to this front end.
    fn local_players(&self) -> Vec<LocalPlayer>;

    /// The locally connected user with this name, if any.
    fn find_local(&self, name: &str) -> Option<LocalPlayer>;

    /// Names of the backends this proxy can route to.
    fn backend_names(&self) -> Vec<String>;

    /// Moves a local user's connection to another backend.
    async fn connect_to_backend(&self, player: PlayerId, backend: &str) -> Result<(), ProxyError>;

    /// Sends a chat message to one local user.
    async fn send_message(&self, player: PlayerId, body: MessageBody) -> Result<(), ProxyError>;

    /// Sends to every user on this front end.
    async fn broadcast(&self, body: MessageBody) -> Result<(), ProxyError>;

    /// Closes a local user's connection, showing `reason`.
    async fn disconnect(&self, player: PlayerId, reason: &str) -> Result<(), ProxyError>;
}
