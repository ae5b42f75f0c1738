//! Messages arriving on the shared subscription.
//!
//! Everything is decoded once, at the boundary, into [`InboundMessage`]; the
//! runner then matches on the variant instead of comparing channel strings.

use crate::error::{BridgeError, ProxyError};
use crate::keys::{ChannelKind, KeySchema};
use crate::proxy::ProxyHandle;
use crate::types::{MessageBody, PresenceRecord, PubSubEnvelope};
use tracing::debug;

/// Cross-instance commands addressed at whichever front end holds a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SendToBackend { player: String, backend: String },
    BroadcastMessage { text: String },
    MessagePlayer { player: String, text: String },
    BroadcastRaw { json: String },
    RawMessagePlayer { player: String, json: String },
    Kick { player: String, reason: String },
}

impl ControlMessage {
    /// Channel this command travels on.
    pub fn kind(&self) -> ChannelKind {
        match self {
            ControlMessage::SendToBackend { .. } => ChannelKind::SendRequest,
            ControlMessage::BroadcastMessage { .. } => ChannelKind::SendMessageToAll,
            ControlMessage::MessagePlayer { .. } => ChannelKind::SendMessageToPlayer,
            ControlMessage::BroadcastRaw { .. } => ChannelKind::SendRawMessageToAll,
            ControlMessage::RawMessagePlayer { .. } => ChannelKind::SendRawMessageToPlayer,
            ControlMessage::Kick { .. } => ChannelKind::KickPlayer,
        }
    }

    /// Wire payload: `<player>:<rest>` for targeted commands, the bare text
    /// for broadcasts.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::SendToBackend { player, backend } => format!("{}:{}", player, backend),
            ControlMessage::BroadcastMessage { text } => text.clone(),
            ControlMessage::MessagePlayer { player, text } => format!("{}:{}", player, text),
            ControlMessage::BroadcastRaw { json } => json.clone(),
            ControlMessage::RawMessagePlayer { player, json } => format!("{}:{}", player, json),
            ControlMessage::Kick { player, reason } => format!("{}:{}", player, reason),
        }
    }

    /// `None` for channels that do not carry control messages.
    pub fn decode(kind: ChannelKind, payload: &str) -> Option<Result<Self, String>> {
        let targeted = || {
            payload
                .split_once(':')
                .filter(|(player, _)| !player.is_empty())
                .map(|(player, rest)| (player.to_string(), rest.to_string()))
                .ok_or_else(|| format!("expected '<player>:<value>', got '{}'", payload))
        };
        let message = match kind {
            ChannelKind::SendRequest => targeted()
                .map(|(player, backend)| ControlMessage::SendToBackend { player, backend }),
            ChannelKind::SendMessageToAll => Ok(ControlMessage::BroadcastMessage {
                text: payload.to_string(),
            }),
            ChannelKind::SendMessageToPlayer => {
                targeted().map(|(player, text)| ControlMessage::MessagePlayer { player, text })
            }
            ChannelKind::SendRawMessageToAll => Ok(ControlMessage::BroadcastRaw {
                json: payload.to_string(),
            }),
            ChannelKind::SendRawMessageToPlayer => {
                targeted().map(|(player, json)| ControlMessage::RawMessagePlayer { player, json })
            }
            ChannelKind::KickPlayer => {
                targeted().map(|(player, reason)| ControlMessage::Kick { player, reason })
            }
            ChannelKind::InfoUpdateNotify | ChannelKind::PubSub => return None,
        };
        Some(message)
    }

    /// Carries the command out against the local proxy. Targeted commands for
    /// users not connected here are silently ignored; the front end that
    /// holds them acts instead. Returns whether anything was done locally.
    pub async fn execute(&self, proxy: &dyn ProxyHandle) -> Result<bool, ProxyError> {
        match self {
            ControlMessage::SendToBackend { player, backend } => {
                let Some(local) = proxy.find_local(player) else {
                    return Ok(false);
                };
                if !proxy.backend_names().iter().any(|b| b == backend) {
                    return Err(ProxyError::UnknownBackend(backend.clone()));
                }
                proxy.connect_to_backend(local.id, backend).await?;
            }
            ControlMessage::BroadcastMessage { text } => {
                proxy.broadcast(MessageBody::Plain(text.clone())).await?;
            }
            ControlMessage::BroadcastRaw { json } => {
                proxy.broadcast(MessageBody::Raw(json.clone())).await?;
            }
            ControlMessage::MessagePlayer { player, text } => {
                let Some(local) = proxy.find_local(player) else {
                    return Ok(false);
                };
                proxy.send_message(local.id, MessageBody::Plain(text.clone())).await?;
            }
            ControlMessage::RawMessagePlayer { player, json } => {
                let Some(local) = proxy.find_local(player) else {
                    return Ok(false);
                };
                proxy.send_message(local.id, MessageBody::Raw(json.clone())).await?;
            }
            ControlMessage::Kick { player, reason } => {
                let Some(local) = proxy.find_local(player) else {
                    return Ok(false);
                };
                proxy.disconnect(local.id, reason).await?;
            }
        }
        debug!("🎮 Executed {:?} locally", self.kind());
        Ok(true)
    }
}

/// A decoded message from the `<prefix>:*` subscription.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Presence(PresenceRecord),
    Control(ControlMessage),
    Bus(PubSubEnvelope),
}

impl InboundMessage {
    /// `Ok(None)` for channels under the prefix that the bridge does not own.
    pub fn decode(keys: &KeySchema, channel: &str, payload: &str) -> Result<Option<Self>, BridgeError> {
        let Some(kind) = keys.parse_channel(channel) else {
            return Ok(None);
        };
        let message = match kind {
            ChannelKind::InfoUpdateNotify => {
                let record = serde_json::from_str(payload)
                    .map_err(|e| BridgeError::malformed(channel, e.to_string()))?;
                InboundMessage::Presence(record)
            }
            ChannelKind::PubSub => {
                let envelope = serde_json::from_str(payload)
                    .map_err(|e| BridgeError::malformed(channel, e.to_string()))?;
                InboundMessage::Bus(envelope)
            }
            control => match ControlMessage::decode(control, payload) {
                Some(Ok(message)) => InboundMessage::Control(message),
                Some(Err(reason)) => return Err(BridgeError::malformed(channel, reason)),
                None => return Ok(None),
            },
        };
        Ok(Some(message))
    }
}
