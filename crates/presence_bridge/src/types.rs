//! Core data types exchanged between front ends.
//!
//! The JSON shapes here are read by every peer in the cluster, so field names
//! are pinned with `serde(rename)` and absent values are omitted rather than
//! written as `null`.

use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use uuid::Uuid;

/// Port written into tombstones so older peers still see a numeric field.
pub const TOMBSTONE_PORT: i32 = -1;

/// Length of an instance identifier.
pub const INSTANCE_ID_LEN: usize = 8;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identifier of a connected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// A random (v4) id, for tests and simulated users.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the hyphenated form used on the wire.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short cluster-unique name of a front end, leased from the store.
///
/// Serialized as a bare string. Deserializing applies the same check as
/// [`InstanceId::new`], so a peer cannot smuggle in a malformed id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

/// Rejected instance id text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance id '{0}': expected {INSTANCE_ID_LEN} ASCII alphanumerics")]
pub struct InvalidInstanceId(pub String);

impl InstanceId {
    /// Accepts exactly eight ASCII alphanumerics.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        Self::try_from(value.into()).ok()
    }

    /// Draws a fresh random candidate.
    pub fn random() -> Self {
        let value: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(INSTANCE_ID_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstanceId {
    type Error = InvalidInstanceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() == INSTANCE_ID_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(value))
        } else {
            Err(InvalidInstanceId(value))
        }
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Presence
// ============================================================================

/// One connected user's location in the cluster.
///
/// Equality and hashing look only at `id`, so a set of records never holds
/// two entries for the same user. A record without a display name is a
/// tombstone announcing removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(rename = "uuid")]
    pub id: PlayerId,
    #[serde(rename = "username", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "hostName", default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(rename = "port", default = "default_port")]
    pub remote_port: i32,
    #[serde(rename = "proxyServer", default, skip_serializing_if = "Option::is_none")]
    pub front_end: Option<InstanceId>,
    #[serde(rename = "childServer", default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

fn default_port() -> i32 {
    TOMBSTONE_PORT
}

impl PresenceRecord {
    /// A live record for a user owned by `front_end`.
    ///
    /// # Arguments
    ///
    /// * `id` - The user's id
    /// * `display_name` - Name shown in lists and used for name lookups
    /// * `remote` - Address the user connected from
    /// * `front_end` - Owning front end
    /// * `backend` - Current backend, `None` while still logging in
    pub fn new(
        id: PlayerId,
        display_name: impl Into<String>,
        remote: SocketAddr,
        front_end: InstanceId,
        backend: Option<String>,
    ) -> Self {
        Self {
            id,
            display_name: Some(display_name.into()),
            remote_host: Some(remote.ip().to_string()),
            remote_port: i32::from(remote.port()),
            front_end: Some(front_end),
            backend,
        }
    }

    /// Removal marker, serialized as `{"uuid":..,"port":-1}`.
    pub fn tombstone(id: PlayerId) -> Self {
        Self {
            id,
            display_name: None,
            remote_host: None,
            remote_port: TOMBSTONE_PORT,
            front_end: None,
            backend: None,
        }
    }

    /// A record without a display name announces removal.
    pub fn is_tombstone(&self) -> bool {
        self.display_name.is_none()
    }

    /// Display name, empty for tombstones.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or_default()
    }

    /// Copy of this record pointing at another backend.
    pub fn with_backend(&self, backend: Option<String>) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }

    /// Field-by-field comparison, for callers that care about more than identity.
    pub fn same_contents(&self, other: &Self) -> bool {
        self.id == other.id
            && self.display_name == other.display_name
            && self.remote_host == other.remote_host
            && self.remote_port == other.remote_port
            && self.front_end == other.front_end
            && self.backend == other.backend
    }
}

impl PartialEq for PresenceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PresenceRecord {}

impl Hash for PresenceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Last known address of a user as written into the IP rosters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Splits on the last `:` so bracket-less IPv6 hosts survive.
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Bus envelope
// ============================================================================

/// Wire unit of the generic pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubEnvelope {
    #[serde(rename = "key")]
    pub channel_key: String,
    #[serde(rename = "message")]
    pub payload: String,
    /// `None` asks every instance, the publisher included, to react.
    #[serde(rename = "publisherVelocityId", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<InstanceId>,
}

// ============================================================================
// Proxy-side views
// ============================================================================

/// A user connected to this front end, as reported by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub id: PlayerId,
    pub name: String,
    pub remote: SocketAddr,
    pub backend: Option<String>,
}

impl LocalPlayer {
    /// The presence record this user has when owned by `front_end`.
    pub fn to_record(&self, front_end: &InstanceId) -> PresenceRecord {
        PresenceRecord::new(
            self.id,
            self.name.clone(),
            self.remote,
            front_end.clone(),
            self.backend.clone(),
        )
    }
}

/// Chat text handed to the proxy for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Plain text, possibly with legacy colour codes.
    Plain(String),
    /// A serialized JSON text component.
    Raw(String),
}
