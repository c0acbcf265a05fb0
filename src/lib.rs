//! driftmq - MQTT 3.1.1 broker core
//!
//! The in-memory session and subscription engine of an MQTT broker:
//! per-client sessions with per-QoS reliability guarantees, a topic trie
//! for subscriptions, retained messages and permissions, and the broker
//! coordinator that authenticates connections and routes publishes.
//!
//! Transports, the wire codec and the CLI live outside this crate; they
//! feed decoded packets into session and broker verbs and drain decoded
//! server packets back out through [`Session::dequeue`].

pub mod auth;
pub mod broker;
pub mod config;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use auth::{
    AuthError, Authenticator, ConnectionRequest, Credentials, PermissionSet, Principal,
    PrincipalId, Quota, StaticAuthenticator,
};
pub use broker::{Broker, ConnectError};
pub use config::Config;
pub use protocol::{ConnectReturnCode, Message, QoS, ServerPacket, SubscribeRequest};
pub use retained::RetainedStore;
pub use session::{EnqueueResult, PacketIdUsage, Session, SessionId, Termination};
pub use topic::TopicTrie;
