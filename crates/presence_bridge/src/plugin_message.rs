//! BungeeCord-style plugin messaging answered from cluster state.
//!
//! Backend servers send requests on the `BungeeCord` / `bungeecord:main`
//! channel encoded with Java's `DataOutput` (`writeUTF` strings, big-endian
//! ints). Each request is decoded once into a [`PluginRequest`]; answers use
//! the same encoding and always start with the echoed sub-channel name.

use crate::api::ClusterApi;
use crate::error::BridgeError;
use crate::types::LocalPlayer;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::debug;

/// Channel name used by pre-1.13 backends.
pub const LEGACY_CHANNEL: &str = "BungeeCord";
/// Namespaced channel name used by 1.13+ backends.
pub const MODERN_CHANNEL: &str = "bungeecord:main";

/// Target selector used by several sub-channels: `ALL` or one backend / user.
pub const ALL: &str = "ALL";

/// Why a plugin message could not be decoded.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PluginMessageError {
    #[error("Plugin message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("Plugin message string is not valid modified UTF-8")]
    InvalidUtf,
    #[error("Plugin message string too long ({0} bytes)")]
    TooLong(usize),
}

/// Which users a count or list request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Backend(String),
}

impl Scope {
    fn parse(raw: String) -> Self {
        if raw == ALL {
            Scope::All
        } else {
            Scope::Backend(raw)
        }
    }

    fn label(&self) -> &str {
        match self {
            Scope::All => ALL,
            Scope::Backend(name) => name,
        }
    }
}

/// Who a chat request goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    Player(String),
}

impl Recipient {
    fn parse(raw: String) -> Self {
        if raw == ALL {
            Recipient::All
        } else {
            Recipient::Player(raw)
        }
    }
}

/// A decoded request, one variant per supported sub-channel.
///
/// Requests for "this user" (`Connect`, `IP`, `UUID`, `GetServer`) refer to
/// the user whose connection carried the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRequest {
    Connect { backend: String },
    ConnectOther { player: String, backend: String },
    Message { to: Recipient, text: String },
    MessageRaw { to: Recipient, json: String },
    KickPlayer { player: String, reason: String },
    Ip,
    IpOther { player: String },
    PlayerCount { scope: Scope },
    PlayerList { scope: Scope },
    GetServers,
    GetServer,
    Uuid,
    UuidOther { player: String },
    /// Needs the proxy's backend address book, which the bridge does not see.
    Unsupported { sub_channel: String },
}

impl PluginRequest {
    /// Decodes the sub-channel and its arguments.
    ///
    /// Unknown sub-channels decode to [`PluginRequest::Unsupported`] rather
    /// than failing, so they can be passed through untouched.
    ///
    /// # Returns
    ///
    /// An error when a string is truncated or not valid modified UTF-8.
    pub fn decode(data: &[u8]) -> Result<Self, PluginMessageError> {
        let mut buf = data;
        let sub_channel = read_utf(&mut buf)?;
        let request = match sub_channel.as_str() {
            "Connect" => PluginRequest::Connect { backend: read_utf(&mut buf)? },
            "ConnectOther" => PluginRequest::ConnectOther {
                player: read_utf(&mut buf)?,
                backend: read_utf(&mut buf)?,
            },
            "Message" => PluginRequest::Message {
                to: Recipient::parse(read_utf(&mut buf)?),
                text: read_utf(&mut buf)?,
            },
            "MessageRaw" => PluginRequest::MessageRaw {
                to: Recipient::parse(read_utf(&mut buf)?),
                json: read_utf(&mut buf)?,
            },
            "KickPlayer" => PluginRequest::KickPlayer {
                player: read_utf(&mut buf)?,
                reason: read_utf(&mut buf)?,
            },
            "IP" => PluginRequest::Ip,
            "IPOther" => PluginRequest::IpOther { player: read_utf(&mut buf)? },
            "PlayerCount" => PluginRequest::PlayerCount { scope: Scope::parse(read_utf(&mut buf)?) },
            "PlayerList" => PluginRequest::PlayerList { scope: Scope::parse(read_utf(&mut buf)?) },
            "GetServers" => PluginRequest::GetServers,
            "GetServer" => PluginRequest::GetServer,
            "UUID" => PluginRequest::Uuid,
            "UUIDOther" => PluginRequest::UuidOther { player: read_utf(&mut buf)? },
            _ => PluginRequest::Unsupported { sub_channel },
        };
        Ok(request)
    }

    fn sub_channel(&self) -> &str {
        match self {
            PluginRequest::Connect { .. } => "Connect",
            PluginRequest::ConnectOther { .. } => "ConnectOther",
            PluginRequest::Message { .. } => "Message",
            PluginRequest::MessageRaw { .. } => "MessageRaw",
            PluginRequest::KickPlayer { .. } => "KickPlayer",
            PluginRequest::Ip => "IP",
            PluginRequest::IpOther { .. } => "IPOther",
            PluginRequest::PlayerCount { .. } => "PlayerCount",
            PluginRequest::PlayerList { .. } => "PlayerList",
            PluginRequest::GetServers => "GetServers",
            PluginRequest::GetServer => "GetServer",
            PluginRequest::Uuid => "UUID",
            PluginRequest::UuidOther { .. } => "UUIDOther",
            PluginRequest::Unsupported { sub_channel } => sub_channel,
        }
    }
}

/// What the proxy adapter should do with the original message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginReply {
    /// Consumed; nothing to send back.
    Handled,
    /// Consumed; send these bytes back to the originating backend.
    Respond(Vec<u8>),
    /// Not ours to answer; let the proxy forward it as usual.
    Pass,
}

/// Answers plugin-message queries from cluster-wide state instead of the
/// local proxy's view.
///
/// # Examples
///
/// ```rust,ignore
/// if PluginMessageBridge::handles_channel(&channel) {
///     match context.plugin_messages().handle(&source, &data).await? {
///         PluginReply::Respond(bytes) => backend.send_plugin_message(&channel, bytes),
///         PluginReply::Handled => {}
///         PluginReply::Pass => forward_as_usual(),
///     }
/// }
/// ```
pub struct PluginMessageBridge {
    api: Arc<ClusterApi>,
}

impl PluginMessageBridge {
    /// Bridge answering through `api`.
    pub fn new(api: Arc<ClusterApi>) -> Self {
        Self { api }
    }

    /// Whether `channel` is one of the two BungeeCord channel names.
    pub fn handles_channel(channel: &str) -> bool {
        channel == LEGACY_CHANNEL || channel == MODERN_CHANNEL
    }

    /// Answers one request sent by the backend `source` is connected to.
    pub async fn handle(&self, source: &LocalPlayer, data: &[u8]) -> Result<PluginReply, BridgeError> {
        let request = match PluginRequest::decode(data) {
            Ok(request) => request,
            Err(e) => return Err(BridgeError::malformed(LEGACY_CHANNEL, e.to_string())),
        };
        debug!("🔌 Plugin message {} from {}", request.sub_channel(), source.name);

        let mut out = BytesMut::new();
        write_utf(&mut out, request.sub_channel())?;

        match &request {
            PluginRequest::Connect { backend } => {
                self.api.send_player(&source.name, backend).await?;
                return Ok(PluginReply::Handled);
            }
            PluginRequest::ConnectOther { player, backend } => {
                self.api.send_player(player, backend).await?;
                return Ok(PluginReply::Handled);
            }
            PluginRequest::Message { to, text } => {
                match to {
                    Recipient::All => self.api.send_message_to_all(text).await?,
                    Recipient::Player(name) => self.api.send_message_to_player(name, text).await?,
                }
                return Ok(PluginReply::Handled);
            }
            PluginRequest::MessageRaw { to, json } => {
                match to {
                    Recipient::All => self.api.send_raw_message_to_all(json).await?,
                    Recipient::Player(name) => self.api.send_raw_message_to_player(name, json).await?,
                }
                return Ok(PluginReply::Handled);
            }
            PluginRequest::KickPlayer { player, reason } => {
                self.api.kick_player(player, reason).await?;
                return Ok(PluginReply::Handled);
            }
            PluginRequest::Ip => {
                let (host, port) = match self.api.player(source.id).await {
                    Some(record) => (record.remote_host.unwrap_or_default(), record.remote_port),
                    None => (source.remote.ip().to_string(), i32::from(source.remote.port())),
                };
                write_utf(&mut out, &host)?;
                out.put_i32(port);
            }
            PluginRequest::IpOther { player } => {
                let Some(record) = self.api.player_by_name(player).await else {
                    return Ok(PluginReply::Pass);
                };
                write_utf(&mut out, record.name())?;
                write_utf(&mut out, record.remote_host.as_deref().unwrap_or_default())?;
                out.put_i32(record.remote_port);
            }
            PluginRequest::PlayerCount { scope } => {
                let count = match scope {
                    Scope::All => self.api.online_count().await,
                    Scope::Backend(name) => self.api.online_count_on(name).await,
                };
                write_utf(&mut out, scope.label())?;
                out.put_i32(i32::try_from(count).unwrap_or(i32::MAX));
            }
            PluginRequest::PlayerList { scope } => {
                let records = match scope {
                    Scope::All => self.api.all_players().await,
                    Scope::Backend(name) => self.api.players_on_backend(name).await,
                };
                let mut names: Vec<&str> = records.iter().map(|r| r.name()).collect();
                names.sort_unstable();
                write_utf(&mut out, scope.label())?;
                write_utf(&mut out, &names.join(", "))?;
            }
            PluginRequest::GetServers => {
                write_utf(&mut out, &self.api.proxy().backend_names().join(", "))?;
            }
            PluginRequest::GetServer => {
                let Some(backend) = source.backend.as_deref() else {
                    return Ok(PluginReply::Pass);
                };
                write_utf(&mut out, backend)?;
            }
            PluginRequest::Uuid => {
                write_utf(&mut out, &source.id.to_string())?;
            }
            PluginRequest::UuidOther { player } => {
                let Some(record) = self.api.player_by_name(player).await else {
                    return Ok(PluginReply::Pass);
                };
                write_utf(&mut out, record.name())?;
                write_utf(&mut out, &record.id.to_string())?;
            }
            PluginRequest::Unsupported { .. } => return Ok(PluginReply::Pass),
        }
        Ok(PluginReply::Respond(out.to_vec()))
    }
}

// ============================================================================
// Java DataInput / DataOutput strings
// ============================================================================

/// Reads a `writeUTF` string: u16 length, then modified UTF-8.
pub fn read_utf(buf: &mut &[u8]) -> Result<String, PluginMessageError> {
    if buf.remaining() < 2 {
        return Err(PluginMessageError::Truncated("string length"));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(PluginMessageError::Truncated("string body"));
    }
    let bytes = &buf[..len];
    buf.advance(len);
    decode_modified_utf8(bytes)
}

fn write_utf(out: &mut BytesMut, value: &str) -> Result<(), BridgeError> {
    let encoded = encode_modified_utf8(value);
    let len = u16::try_from(encoded.len())
        .map_err(|_| BridgeError::malformed(LEGACY_CHANNEL, PluginMessageError::TooLong(encoded.len()).to_string()))?;
    out.put_u16(len);
    out.put_slice(&encoded);
    Ok(())
}

/// NUL becomes `C0 80` and characters outside the BMP are written as two
/// three-byte surrogates, as `DataOutputStream` does.
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

/// Inverse of [`encode_modified_utf8`]. Surrogate pairs are recombined;
/// a lone surrogate is rejected.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, PluginMessageError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let cont = |idx: usize| -> Result<u16, PluginMessageError> {
            match bytes.get(idx) {
                Some(&c) if c & 0xC0 == 0x80 => Ok(u16::from(c & 0x3F)),
                _ => Err(PluginMessageError::InvalidUtf),
            }
        };
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push((u16::from(b & 0x1F) << 6) | cont(i + 1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            units.push((u16::from(b & 0x0F) << 12) | (cont(i + 1)? << 6) | cont(i + 2)?);
            i += 3;
        } else {
            return Err(PluginMessageError::InvalidUtf);
        }
    }
    String::from_utf16(&units).map_err(|_| PluginMessageError::InvalidUtf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(parts: &[&str]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for part in parts {
            write_utf(&mut out, part).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn test_modified_utf8_matches_java() {
        assert_eq!(encode_modified_utf8("abc"), b"abc".to_vec());
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        assert_eq!(encode_modified_utf8("é"), vec![0xC3, 0xA9]);
        // U+1F600 as a surrogate pair, three bytes each
        assert_eq!(
            encode_modified_utf8("😀"),
            vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
        for text in ["", "plain", "\0nul", "日本語", "mixed 😀 text"] {
            assert_eq!(decode_modified_utf8(&encode_modified_utf8(text)).unwrap(), text);
        }
        assert!(decode_modified_utf8(&[0xC3]).is_err());
    }

    #[test]
    fn test_decode_requests() {
        assert_eq!(
            PluginRequest::decode(&frame(&["ConnectOther", "Alice", "lobby"])).unwrap(),
            PluginRequest::ConnectOther { player: "Alice".to_string(), backend: "lobby".to_string() }
        );
        assert_eq!(
            PluginRequest::decode(&frame(&["Message", "ALL", "hello"])).unwrap(),
            PluginRequest::Message { to: Recipient::All, text: "hello".to_string() }
        );
        assert_eq!(
            PluginRequest::decode(&frame(&["PlayerCount", "survival"])).unwrap(),
            PluginRequest::PlayerCount { scope: Scope::Backend("survival".to_string()) }
        );
        assert_eq!(
            PluginRequest::decode(&frame(&["Forward", "ALL", "x"])).unwrap(),
            PluginRequest::Unsupported { sub_channel: "Forward".to_string() }
        );
    }

    #[test]
    fn test_truncated_request() {
        let mut data = frame(&["IPOther"]);
        data.extend_from_slice(&[0x00, 0x05, b'A']);
        assert_eq!(
            PluginRequest::decode(&data),
            Err(PluginMessageError::Truncated("string body"))
        );
        assert_eq!(
            PluginRequest::decode(&[0x00]),
            Err(PluginMessageError::Truncated("string length"))
        );
    }

    mod bridge {
        use super::*;
        use crate::bus::PubSubBus;
        use crate::keys::KeySchema;
        use crate::proxy::ProxyHandle;
        use crate::registry::PresenceRegistry;
        use crate::store::MemoryStore;
        use crate::test_support::RecordingProxy;
        use crate::types::{InstanceId, PlayerId, PresenceRecord};
        use crate::view::{IpViewCache, PlayerViewCache};
        use std::time::Duration;

        fn setup() -> (Arc<RecordingProxy>, Arc<PresenceRegistry>, PluginMessageBridge) {
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
                Arc::new(PubSubBus::new(store, keys, id)),
                proxy.clone(),
            );
            (proxy, registry, PluginMessageBridge::new(Arc::new(api)))
        }

        /// Reads `n` strings, then an optional trailing int.
        fn read_reply(bytes: &[u8], n: usize) -> (Vec<String>, Option<i32>) {
            let mut buf = bytes;
            let strings = (0..n).map(|_| read_utf(&mut buf).unwrap()).collect();
            let int = (buf.len() == 4).then(|| buf.get_i32());
            (strings, int)
        }

        #[tokio::test]
        async fn test_connect_moves_the_source_player() {
            let (proxy, _, bridge) = setup();
            let id = proxy.connect("Alice", Some("lobby"));
            let alice = proxy.find_local("Alice").unwrap();

            let reply = bridge.handle(&alice, &frame(&["Connect", "survival"])).await.unwrap();
            assert_eq!(reply, PluginReply::Handled);
            assert_eq!(proxy.moves(), vec![(id, "survival".to_string())]);
        }

        #[tokio::test]
        async fn test_player_count_uses_cluster_registry() {
            let (proxy, registry, bridge) = setup();
            proxy.connect("Alice", Some("lobby"));
            let alice = proxy.find_local("Alice").unwrap();
            let remote = PresenceRecord::new(
                PlayerId::new(),
                "Bob",
                "10.0.0.9:2000".parse().unwrap(),
                InstanceId::new("BBBBBBBB").unwrap(),
                Some("lobby".to_string()),
            );
            registry.receive_remote_notification(remote).await;

            let PluginReply::Respond(bytes) = bridge
                .handle(&alice, &frame(&["PlayerCount", "lobby"]))
                .await
                .unwrap()
            else {
                panic!("expected a response");
            };
            assert_eq!(read_reply(&bytes, 2), (vec!["PlayerCount".to_string(), "lobby".to_string()], Some(1)));

            let PluginReply::Respond(bytes) = bridge
                .handle(&alice, &frame(&["PlayerList", "ALL"]))
                .await
                .unwrap()
            else {
                panic!("expected a response");
            };
            assert_eq!(
                read_reply(&bytes, 3).0,
                vec!["PlayerList".to_string(), "ALL".to_string(), "Bob".to_string()]
            );
        }

        #[tokio::test]
        async fn test_ip_falls_back_to_local_address() {
            let (proxy, _, bridge) = setup();
            proxy.connect("Alice", None);
            let alice = proxy.find_local("Alice").unwrap();

            let PluginReply::Respond(bytes) = bridge.handle(&alice, &frame(&["IP"])).await.unwrap() else {
                panic!("expected a response");
            };
            let (strings, port) = read_reply(&bytes, 2);
            assert_eq!(strings, vec!["IP".to_string(), "10.0.0.1".to_string()]);
            assert_eq!(port, Some(i32::from(alice.remote.port())));
        }

        #[tokio::test]
        async fn test_unknown_targets_and_sub_channels_pass_through() {
            let (proxy, _, bridge) = setup();
            proxy.connect("Alice", None);
            let alice = proxy.find_local("Alice").unwrap();

            assert_eq!(
                bridge.handle(&alice, &frame(&["UUIDOther", "Ghost"])).await.unwrap(),
                PluginReply::Pass
            );
            assert_eq!(
                bridge.handle(&alice, &frame(&["GetServer"])).await.unwrap(),
                PluginReply::Pass
            );
            assert_eq!(
                bridge.handle(&alice, &frame(&["ServerIP", "lobby"])).await.unwrap(),
                PluginReply::Pass
            );
            assert!(bridge.handle(&alice, &[0x00]).await.is_err());
        }
    }

    #[test]
    fn test_channel_names() {
        assert!(PluginMessageBridge::handles_channel("BungeeCord"));
        assert!(PluginMessageBridge::handles_channel("bungeecord:main"));
        assert!(!PluginMessageBridge::handles_channel("minecraft:brand"));
    }
}
