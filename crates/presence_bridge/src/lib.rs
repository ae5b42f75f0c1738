//! # Presence Bridge
//!
//! A shared presence registry and message bus for a fleet of proxy front
//! ends. Every front end writes the users connected to it into a shared
//! key-value store, announces changes on a pub/sub channel, and keeps a local
//! index of the whole cluster so lookups never touch the network.
//!
//! ## Core Features
//!
//! - **Instance identity**: each front end leases a short unique id from the store
//! - **Presence registry**: cluster-wide index by id, name, front end and backend
//! - **Change notifications**: peers apply each other's writes as they happen,
//!   with a periodic full refetch as the backstop
//! - **Cross-instance control**: move, message or kick a user wherever they are connected
//! - **Generic bus**: application handlers keyed by channel name
//! - **Roster views**: per-backend user and address lists
//!
//! ## Architecture Overview
//!
//! All coordination goes through one namespace prefix (by default
//! `velocity-redis-bridge`). Presence records live at `<prefix>:players:<uuid>`,
//! rosters at `<prefix>:players:<frontEnd>:<backend>`, and every front end
//! subscribes to `<prefix>:*`. [`BridgeContext`] wires the pieces together;
//! the proxy side plugs in through [`ProxyHandle`] and drives
//! [`SessionHooks`] from its connection events.
//!
//! ## Quick Start Example
//!
//! ```rust,ignore
//! use presence_bridge::*;
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::default();
//! let store = Arc::new(RedisStore::connect(&config.store).await?);
//! let ctx = BridgeContext::start(config, store, my_proxy).await?;
//!
//! ctx.api().bus().on("chat", |payload| {
//!     println!("chat: {}", payload);
//!     Ok(())
//! });
//! ctx.api().send_player("Alice", "survival").await?;
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod identity;
pub mod keys;
pub mod plugin_message;
pub mod proxy;
pub mod registry;
pub mod runner;
pub mod store;
pub mod types;
pub mod view;

#[cfg(test)]
mod test_support;

pub use api::{ClusterApi, LoginOutcome, SessionHooks, ALREADY_CONNECTED_REASON};
pub use bus::{BusStats, FnHandler, MessageHandler, PubSubBus};
pub use config::{BridgeConfig, Credentials, StoreSettings};
pub use context::BridgeContext;
pub use control::{ControlMessage, InboundMessage};
pub use error::{BridgeError, HandlerError, ProxyError, StoreError};
pub use identity::InstanceIdentityLeaser;
pub use keys::{ChannelKind, KeySchema, DEFAULT_PREFIX};
pub use plugin_message::{PluginMessageBridge, PluginReply, PluginRequest};
pub use proxy::ProxyHandle;
pub use registry::{LeaseRefresh, PresenceRegistry};
pub use runner::{ReconnectPolicy, RunnerState, SubscriptionRunner};
pub use store::{MemoryStore, MessageStream, RedisStore, Store, StoreMessage};
pub use types::{HostPort, InstanceId, InvalidInstanceId, LocalPlayer, MessageBody, PlayerId, PresenceRecord, PubSubEnvelope};
pub use view::{IpSnapshot, IpViewCache, PlayerSnapshot, PlayerViewCache, RosterPublisher};
