//! Authentication and authorization
//!
//! The broker core delegates connection authentication to an
//! [`Authenticator`] implementation and enforces the resulting
//! [`Principal`]'s permission sets and quota itself. A config-backed
//! in-memory implementation lives in [`static_auth`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::protocol::Message;
use crate::topic::{validate_topic_filter, TopicTrie};

mod static_auth;

pub use static_auth::StaticAuthenticator;

/// Identifies a principal across connections of the same identity
pub type PrincipalId = Uuid;

/// Authenticator failure: the backing service could not answer.
/// Surfaced to the client as a `ServerUnavailable` CONNACK.
#[derive(Debug)]
pub enum AuthError {
    Unavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unavailable(msg) => write!(f, "authentication service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Username and optional password taken from the CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<Bytes>,
}

/// Everything the transport layer knows about a connection attempt
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Client identifier from the CONNECT packet
    pub client_identifier: String,
    /// Clean-session flag from the CONNECT packet
    pub clean_session: bool,
    /// Whether the transport is TLS-protected
    pub secure: bool,
    /// Credentials from the CONNECT packet, if any
    pub credentials: Option<Credentials>,
    /// Peer certificate chain presented during the TLS handshake
    pub certificate_chain: Option<Vec<Bytes>>,
    /// Request headers of a WebSocket upgrade, if any
    pub http_headers: Option<Vec<(String, String)>>,
    /// Remote peer address
    pub remote_address: Option<SocketAddr>,
    /// Will message from the CONNECT packet
    pub will: Option<Message>,
}

/// Per-principal resource limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    /// How long a disconnected persistent session is kept
    pub max_idle_session_ttl: Duration,
    /// Largest message payload accepted for delivery to this principal
    pub max_packet_size: usize,
    /// Number of packet identifiers available for concurrent in-flight
    /// outbound QoS 1/2 transactions
    pub max_packet_identifiers: u16,
    /// QoS 0 output queue depth (overflow drops the oldest)
    pub max_queue_size_qos0: usize,
    /// QoS 1 output queue depth (overflow terminates the session)
    pub max_queue_size_qos1: usize,
    /// QoS 2 output queue depth (overflow terminates the session)
    pub max_queue_size_qos2: usize,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_idle_session_ttl: Duration::from_secs(60),
            max_packet_size: 65535,
            max_packet_identifiers: 10,
            max_queue_size_qos0: 100,
            max_queue_size_qos1: 100,
            max_queue_size_qos2: 100,
        }
    }
}

/// A set of topic filters; a topic or filter is permitted iff it matches
/// at least one member.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    filters: TopicTrie<()>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set containing a single filter
    pub fn singleton(filter: &str) -> Result<Self, &'static str> {
        let mut set = Self::new();
        set.insert(filter)?;
        Ok(set)
    }

    /// Build a set from a list of filters
    pub fn from_filters<'a, I>(filters: I) -> Result<Self, &'static str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = Self::new();
        for filter in filters {
            set.insert(filter)?;
        }
        Ok(set)
    }

    /// Add a filter to the set
    pub fn insert(&mut self, filter: &str) -> Result<(), &'static str> {
        validate_topic_filter(filter)?;
        self.filters.insert(filter, ());
        Ok(())
    }

    /// Merge another set into this one
    pub fn union(&mut self, other: PermissionSet) {
        self.filters.union(other.filters);
    }

    /// True when the topic name matches at least one filter
    pub fn permits_topic(&self, topic: &str) -> bool {
        self.filters.matches_any(topic)
    }

    /// True when the subscription filter is covered by at least one filter
    pub fn permits_filter(&self, filter: &str) -> bool {
        self.filters.covers_filter(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// An authenticated identity with its limits and permissions
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub username: Option<String>,
    pub quota: Quota,
    pub publish_permissions: PermissionSet,
    pub subscribe_permissions: PermissionSet,
    pub retain_permissions: PermissionSet,
}

/// Connection authentication collaborator
///
/// `authenticate` maps a connection request to a principal identifier:
/// `Ok(None)` means the connection is denied, `Err(_)` means the backing
/// service failed. `principal` resolves the identifier to the principal's
/// current permissions and quota; `Ok(None)` denies the connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &ConnectionRequest,
    ) -> Result<Option<PrincipalId>, AuthError>;

    async fn principal(&self, principal_id: PrincipalId) -> Result<Option<Principal>, AuthError>;
}
