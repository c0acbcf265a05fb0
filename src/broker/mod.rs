//! Broker core
//!
//! Owns the session registry, the subscription index and the retained
//! store, and routes downstream publishes to matching sessions. Connection
//! handlers acquire a session through [`Broker::with_session`], which
//! authenticates the request, resumes or creates the session, and cancels
//! the handler when the session is displaced or terminated.
//!
//! Locking: the client-id index, subscription trie and retained store are
//! mutated together under one coarse mutex so they stay mutually
//! consistent; the session registry is a concurrent map keyed by session
//! id, and per-session state has its own lock. The routing mutex is taken
//! before any registry access, never the other way around.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, ConnectionRequest, Principal, PrincipalId};
use crate::protocol::{ConnectReturnCode, Message, QoS, ServerPacket, SubscribeRequest};
use crate::retained::RetainedStore;
use crate::session::{Session, SessionId, Termination};
use crate::topic::{validate_topic_filter, validate_topic_name, TopicTrie};

/// Connection rejection, translated by the transport into a CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The authentication service failed
    ServerUnavailable,
    /// The request was denied
    NotAuthorized,
}

impl ConnectError {
    pub fn return_code(self) -> ConnectReturnCode {
        match self {
            ConnectError::ServerUnavailable => ConnectReturnCode::ServerUnavailable,
            ConnectError::NotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::ServerUnavailable => write!(f, "server unavailable"),
            ConnectError::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// State mutated under the coarse routing lock
struct RoutingState {
    /// Client identifier -> current session
    by_client: AHashMap<Arc<str>, SessionId>,
    /// Topic filter -> subscribed sessions with their granted QoS
    subscriptions: TopicTrie<AHashMap<SessionId, QoS>>,
    retained: RetainedStore,
}

/// The broker
pub struct Broker {
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<SessionId, Arc<Session>>,
    routing: Mutex<RoutingState>,
    next_session_id: AtomicU64,
}

impl Broker {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            sessions: DashMap::new(),
            routing: Mutex::new(RoutingState {
                by_client: AHashMap::new(),
                subscriptions: TopicTrie::new(),
                retained: RetainedStore::new(),
            }),
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Authenticate a connection request and run `handler` with exclusive
    /// ownership of the client's session.
    ///
    /// Returns `Err` when the request is rejected (the caller answers with
    /// the matching CONNACK), `Ok(Some(_))` when the handler ran to
    /// completion, and `Ok(None)` when the handler was cancelled because
    /// the session was displaced by another connection or terminated on
    /// queue overflow. Ownership is released either way; clean sessions
    /// are removed from the broker on release.
    pub async fn with_session<F, Fut, T>(
        &self,
        request: ConnectionRequest,
        handler: F,
    ) -> Result<Option<T>, ConnectError>
    where
        F: FnOnce(Arc<Session>, bool) -> Fut,
        Fut: Future<Output = T>,
    {
        let principal_id = match self.authenticator.authenticate(&request).await {
            Ok(Some(principal_id)) => principal_id,
            Ok(None) => {
                debug!(client = %request.client_identifier, "connection denied");
                return Err(ConnectError::NotAuthorized);
            }
            Err(e) => {
                warn!(client = %request.client_identifier, error = %e, "authenticator failed");
                return Err(ConnectError::ServerUnavailable);
            }
        };
        let principal = match self.authenticator.principal(principal_id).await {
            Ok(Some(principal)) => principal,
            Ok(None) => {
                debug!(client = %request.client_identifier, "unknown principal");
                return Err(ConnectError::NotAuthorized);
            }
            Err(e) => {
                warn!(client = %request.client_identifier, error = %e, "authenticator failed");
                return Err(ConnectError::ServerUnavailable);
            }
        };

        let (session, session_present) = self.acquire_session(&request, principal_id, principal);
        let (epoch, mut cancelled) = session.attach();
        if session_present {
            session.resume_in_flight();
        }
        session.set_will(request.will.clone());

        info!(
            client = %session.client_identifier(),
            session_id = session.session_id(),
            session_present,
            "session acquired"
        );

        let output = tokio::select! {
            value = handler(session.clone(), session_present) => Some(value),
            reason = cancelled.recv() => {
                debug!(
                    client = %session.client_identifier(),
                    session_id = session.session_id(),
                    ?reason,
                    "session handler cancelled"
                );
                None
            }
        };

        session.detach(epoch);
        if session.is_clean_session() {
            self.remove_session(&session);
        }
        Ok(output)
    }

    /// Look up, resume or create the session for a connection request.
    /// Implements the clean-session and takeover rules of MQTT 3.1.1.
    fn acquire_session(
        &self,
        request: &ConnectionRequest,
        principal_id: PrincipalId,
        principal: Principal,
    ) -> (Arc<Session>, bool) {
        let client: Arc<str> = request.client_identifier.as_str().into();
        let mut routing = self.routing.lock();

        let existing = routing
            .by_client
            .get(&client)
            .and_then(|session_id| self.sessions.get(session_id))
            .map(|entry| entry.value().clone());

        if let Some(old) = existing {
            if !request.clean_session
                && !old.is_clean_session()
                && old.principal_id() == principal_id
            {
                // resume the persistent session; attach() displaces the
                // current owner, if any
                return (old, true);
            }
            // the client asked for a clean slate, the old session was
            // clean itself, or the client identifier changed hands:
            // discard the old session and start fresh
            old.kill_owner(Termination::Displaced);
            self.purge_session_locked(&mut routing, &old);
        }

        let session = self.create_session_locked(
            &mut routing,
            client,
            principal_id,
            request.clean_session,
            principal,
        );
        (session, false)
    }

    fn create_session_locked(
        &self,
        routing: &mut RoutingState,
        client: Arc<str>,
        principal_id: PrincipalId,
        clean_session: bool,
        principal: Principal,
    ) -> Arc<Session> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            session_id,
            client.clone(),
            principal_id,
            clean_session,
            principal,
        ));
        routing.by_client.insert(client, session_id);
        self.sessions.insert(session_id, session.clone());
        session
    }

    /// Remove a session's traces from the index and registry. The caller
    /// holds the routing lock.
    fn purge_session_locked(&self, routing: &mut RoutingState, session: &Session) {
        for filter in session.subscription_filters() {
            if let Some(subscribers) = routing.subscriptions.get_mut(&filter) {
                subscribers.remove(&session.session_id());
                if subscribers.is_empty() {
                    routing.subscriptions.remove(&filter);
                }
            }
        }
        if routing
            .by_client
            .get(session.client_identifier())
            .is_some_and(|&id| id == session.session_id())
        {
            routing.by_client.remove(session.client_identifier());
        }
        session.set_will(None);
        self.sessions.remove(&session.session_id());
        debug!(
            client = %session.client_identifier(),
            session_id = session.session_id(),
            "session removed"
        );
    }

    /// Remove a session entirely (clean-session release or expiry)
    fn remove_session(&self, session: &Session) {
        let mut routing = self.routing.lock();
        self.purge_session_locked(&mut routing, session);
    }

    /// Fan a message out to every session with a matching subscription,
    /// downgrading the QoS to the subscription's ceiling. Updates the
    /// retained store first when the retain flag is set; permission checks
    /// belong to the upstream entry points.
    pub fn publish_downstream(&self, message: &Message) {
        let targets: Vec<(Arc<Session>, QoS)> = {
            let mut routing = self.routing.lock();
            if message.retain {
                routing.retained.update(message);
            }
            let mut pairs: Vec<(SessionId, QoS)> = Vec::new();
            routing.subscriptions.matches(&message.topic, |subscribers| {
                for (&session_id, &qos) in subscribers {
                    pairs.push((session_id, qos));
                }
            });
            pairs
                .into_iter()
                .filter_map(|(session_id, qos)| {
                    self.sessions
                        .get(&session_id)
                        .map(|entry| (entry.value().clone(), qos))
                })
                .collect()
        };

        trace!(topic = %message.topic, subscribers = targets.len(), "routing publish");

        for (session, filter_qos) in targets {
            let mut delivery = message.clone();
            delivery.qos = message.qos.min(filter_qos);
            // forwarded publishes carry retain=0; only subscribe-time
            // replay out of the retained store sets it
            delivery.retain = false;
            session.enqueue_message(delivery);
        }
    }

    /// Publish on behalf of a client, applying its publish permissions.
    /// A retained publish additionally requires retain permission; denial
    /// drops the message silently.
    pub fn publish_upstream(&self, session: &Session, message: Message) {
        if validate_topic_name(&message.topic).is_err() {
            debug!(client = %session.client_identifier(), topic = %message.topic, "invalid topic name");
            return;
        }
        let principal = session.principal();
        if !principal.publish_permissions.permits_topic(&message.topic) {
            debug!(
                client = %session.client_identifier(),
                topic = %message.topic,
                "publish permission denied"
            );
            return;
        }
        if message.retain && !principal.retain_permissions.permits_topic(&message.topic) {
            debug!(
                client = %session.client_identifier(),
                topic = %message.topic,
                "retain permission denied"
            );
            return;
        }
        self.publish_downstream(&message);
    }

    /// Inbound PUBLISH from a client. QoS 0 and 1 fan out immediately
    /// (QoS 1 is acknowledged first); QoS 2 is held in the inbound
    /// register until the client releases it.
    pub fn process_publish(
        &self,
        session: &Arc<Session>,
        packet_id: Option<u16>,
        dup: bool,
        message: Message,
    ) {
        trace!(
            client = %session.client_identifier(),
            topic = %message.topic,
            qos = ?message.qos,
            dup,
            "inbound publish"
        );
        match message.qos {
            QoS::AtMostOnce => self.publish_upstream(session, message),
            QoS::AtLeastOnce => {
                let Some(packet_id) = packet_id else {
                    trace!("QoS 1 publish without packet id ignored");
                    return;
                };
                session.enqueue_control(ServerPacket::PublishAcknowledged { packet_id });
                self.publish_upstream(session, message);
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = packet_id else {
                    trace!("QoS 2 publish without packet id ignored");
                    return;
                };
                session.register_inbound(packet_id, message);
            }
        }
    }

    /// Inbound PUBREL: complete the two-phase receive and fan the stored
    /// message out. An unknown packet id still answers with PUBCOMP but
    /// routes nothing.
    pub fn process_publish_release(&self, session: &Arc<Session>, packet_id: u16) {
        if let Some(message) = session.release_inbound(packet_id) {
            self.publish_upstream(session, message);
        }
    }

    /// Inbound SUBSCRIBE: record permitted filters in the session and the
    /// subscription index, acknowledge, and replay matching retained
    /// messages. Each filter is granted independently; a permission or
    /// validation failure yields a `None` grant.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        packet_id: u16,
        requests: Vec<SubscribeRequest>,
    ) {
        let principal = session.principal();
        let mut granted = Vec::with_capacity(requests.len());
        let mut replays: Vec<(QoS, Vec<Message>)> = Vec::new();

        {
            let mut routing = self.routing.lock();
            for request in &requests {
                if validate_topic_filter(&request.filter).is_err() {
                    debug!(
                        client = %session.client_identifier(),
                        filter = %request.filter,
                        "invalid topic filter"
                    );
                    granted.push(None);
                    continue;
                }
                if !principal.subscribe_permissions.permits_filter(&request.filter) {
                    debug!(
                        client = %session.client_identifier(),
                        filter = %request.filter,
                        "subscribe permission denied"
                    );
                    granted.push(None);
                    continue;
                }

                session.record_subscription(request.filter.as_str().into(), request.qos);
                match routing.subscriptions.get_mut(&request.filter) {
                    Some(subscribers) => {
                        subscribers.insert(session.session_id(), request.qos);
                    }
                    None => {
                        let mut subscribers = AHashMap::with_capacity(1);
                        subscribers.insert(session.session_id(), request.qos);
                        routing.subscriptions.insert(&request.filter, subscribers);
                    }
                }
                granted.push(Some(request.qos));
                replays.push((request.qos, routing.retained.matching(&request.filter)));

                trace!(
                    client = %session.client_identifier(),
                    filter = %request.filter,
                    qos = ?request.qos,
                    "subscribed"
                );
            }
        }

        // the acknowledgement is queued before the replay publishes and
        // control packets drain first, so it is observed first
        session.enqueue_control(ServerPacket::SubscribeAcknowledged { packet_id, granted });

        for (filter_qos, messages) in replays {
            for retained in messages {
                let mut delivery = retained.clone();
                delivery.qos = retained.qos.min(filter_qos);
                delivery.retain = true;
                session.enqueue_message(delivery);
            }
        }
    }

    /// Inbound UNSUBSCRIBE
    pub fn unsubscribe(&self, session: &Arc<Session>, packet_id: u16, filters: Vec<String>) {
        {
            let mut routing = self.routing.lock();
            for filter in &filters {
                if session.drop_subscription(filter) {
                    if let Some(subscribers) = routing.subscriptions.get_mut(filter) {
                        subscribers.remove(&session.session_id());
                        if subscribers.is_empty() {
                            routing.subscriptions.remove(filter);
                        }
                    }
                    trace!(
                        client = %session.client_identifier(),
                        filter = %filter,
                        "unsubscribed"
                    );
                }
            }
        }
        session.enqueue_control(ServerPacket::UnsubscribeAcknowledged { packet_id });
    }

    /// Graceful DISCONNECT: the will is discarded, the session itself is
    /// released when the handler returns.
    pub fn disconnect(&self, session: &Session) {
        session.set_will(None);
    }

    /// Publish a session's will message, if it still has one. Called by
    /// the transport on ungraceful connection loss.
    pub fn publish_will(&self, session: &Session) {
        if let Some(will) = session.take_will() {
            debug!(client = %session.client_identifier(), topic = %will.topic, "publishing will");
            self.publish_upstream(session, will);
        }
    }

    /// Drop disconnected persistent sessions that have exceeded their idle
    /// TTL. Intended to be called periodically by the embedding server.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        for session in expired {
            info!(
                client = %session.client_identifier(),
                session_id = session.session_id(),
                "expiring idle session"
            );
            self.remove_session(&session);
        }
    }

    /// Number of sessions known to the broker
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of stored retained messages
    pub fn retained_count(&self) -> usize {
        self.routing.lock().retained.len()
    }
}
