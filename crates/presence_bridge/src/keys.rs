//! Key and channel naming.
//!
//! Every front end in the cluster must agree on these names byte for byte,
//! so nothing outside this module builds a store key by hand.

use crate::types::{InstanceId, PlayerId};

/// Prefix used by every deployed front end unless configured otherwise.
pub const DEFAULT_PREFIX: &str = "velocity-redis-bridge";

const PLAYERS_SEGMENT: &str = "players";
const IP_SEGMENT: &str = "ip";
const SERVER_ID_SEGMENT: &str = "serverid";
const KEEPALIVE_SEGMENT: &str = "keepalive";

/// Logical channels multiplexed over the single `<prefix>:*` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    SendRequest,
    SendMessageToAll,
    SendMessageToPlayer,
    SendRawMessageToAll,
    SendRawMessageToPlayer,
    KickPlayer,
    InfoUpdateNotify,
    PubSub,
}

impl ChannelKind {
    /// Every reserved channel, in wire-documentation order.
    pub const ALL: [ChannelKind; 8] = [
        ChannelKind::SendRequest,
        ChannelKind::SendMessageToAll,
        ChannelKind::SendMessageToPlayer,
        ChannelKind::SendRawMessageToAll,
        ChannelKind::SendRawMessageToPlayer,
        ChannelKind::KickPlayer,
        ChannelKind::InfoUpdateNotify,
        ChannelKind::PubSub,
    ];

    /// The part after `<prefix>:`. These strings are shared with every peer
    /// and must never change.
    pub fn suffix(self) -> &'static str {
        match self {
            ChannelKind::SendRequest => "send-request",
            ChannelKind::SendMessageToAll => "send-message-to-all",
            ChannelKind::SendMessageToPlayer => "send-message-to-player",
            ChannelKind::SendRawMessageToAll => "send-raw-message-to-all",
            ChannelKind::SendRawMessageToPlayer => "send-raw-message-to-player",
            ChannelKind::KickPlayer => "kick-player",
            ChannelKind::InfoUpdateNotify => "info-update-notify",
            ChannelKind::PubSub => "pubsub",
        }
    }

    /// Inverse of [`suffix`](Self::suffix).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.suffix() == suffix)
    }
}

/// A key found under `<prefix>:players:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayersKey {
    /// `<prefix>:players:<id>`, a JSON presence record.
    Presence(String),
    /// `<prefix>:players:<frontEnd>:<backend>`, a roster hash.
    Roster { front_end: String, backend: String },
}

/// Deterministic names for everything the bridge stores or publishes.
///
/// All front ends of one cluster must agree on the prefix; instances with
/// different prefixes share a store without seeing each other.
///
/// # Examples
///
/// ```rust,ignore
/// let keys = KeySchema::new("staging");
/// assert_eq!(keys.channel(ChannelKind::PubSub), "staging:pubsub");
/// assert_eq!(keys.subscribe_pattern(), "staging:*");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    prefix: String,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySchema {
    /// Uses `prefix` verbatim as the first key segment.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // ========================================================================
    // Keys
    // ========================================================================

    /// Key of one user's JSON presence record.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// // velocity-redis-bridge:players:0f1e...-...
    /// let key = KeySchema::default().presence(&player_id);
    /// ```
    pub fn presence(&self, id: &PlayerId) -> String {
        format!("{}:{}:{}", self.prefix, PLAYERS_SEGMENT, id)
    }

    /// Hash of user id to display name for one front end's users on one
    /// backend. It shares the `players` namespace with presence records.
    pub fn roster(&self, front_end: &InstanceId, backend: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, PLAYERS_SEGMENT, front_end, backend)
    }

    /// Hash of user id to `host:port` for one front end's users on one backend.
    pub fn ip_roster(&self, front_end: &InstanceId, backend: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, IP_SEGMENT, front_end, backend)
    }

    /// Lease key that reserves an instance id while its owner is alive.
    pub fn server_id(&self, id: &InstanceId) -> String {
        format!("{}:{}:{}", self.prefix, SERVER_ID_SEGMENT, id)
    }

    /// Scan pattern covering presence records and roster hashes alike.
    pub fn players_pattern(&self) -> String {
        format!("{}:{}:*", self.prefix, PLAYERS_SEGMENT)
    }

    /// Scan pattern covering every IP roster hash.
    pub fn ip_pattern(&self) -> String {
        format!("{}:{}:*", self.prefix, IP_SEGMENT)
    }

    /// Sorts a key returned by a [`players_pattern`](Self::players_pattern)
    /// scan. Player ids never contain `:`, so one trailing segment means a
    /// presence record and anything longer is a roster whose backend name is
    /// everything after the front end id.
    pub fn classify_players_key(&self, key: &str) -> Option<PlayersKey> {
        let rest = self.strip(key, PLAYERS_SEGMENT)?;
        match rest.split_once(':') {
            None if !rest.is_empty() => Some(PlayersKey::Presence(rest.to_string())),
            Some((front_end, backend)) if !front_end.is_empty() && !backend.is_empty() => {
                Some(PlayersKey::Roster {
                    front_end: front_end.to_string(),
                    backend: backend.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Parses `<prefix>:ip:<frontEnd>:<backend>` into its two trailing parts.
    pub fn parse_ip_key(&self, key: &str) -> Option<(String, String)> {
        let rest = self.strip(key, IP_SEGMENT)?;
        let (front_end, backend) = rest.split_once(':')?;
        if front_end.is_empty() || backend.is_empty() {
            return None;
        }
        Some((front_end.to_string(), backend.to_string()))
    }

    fn strip<'a>(&self, key: &'a str, segment: &str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_prefix(segment)?
            .strip_prefix(':')
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Full channel name for a reserved kind, e.g. `<prefix>:kick-player`.
    pub fn channel(&self, kind: ChannelKind) -> String {
        format!("{}:{}", self.prefix, kind.suffix())
    }

    /// The one pattern subscription every front end holds.
    pub fn subscribe_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Channel an instance pings itself on when its subscription is idle.
    /// It sits under the subscribed pattern but outside the reserved
    /// suffixes, so [`parse_channel`](Self::parse_channel) ignores it.
    pub fn keepalive_channel(&self, id: &InstanceId) -> String {
        format!("{}:{}:{}", self.prefix, KEEPALIVE_SEGMENT, id)
    }

    /// Maps a full channel name back to its reserved kind. `None` for
    /// channels of another prefix and for unreserved suffixes.
    pub fn parse_channel(&self, channel: &str) -> Option<ChannelKind> {
        let suffix = channel.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        ChannelKind::from_suffix(suffix)
    }
}
