//! MQTT session state machine
//!
//! A session owns three bounded publish queues (one per QoS) plus a
//! control-packet queue, the in-flight registers for outbound QoS 1/2
//! transactions, the inbound QoS 2 register, and the free packet-identifier
//! pool. The network layer drains the queues through the async
//! [`Session::dequeue`] and feeds acknowledgements back through the
//! `process_*` verbs.
//!
//! Invariant: the free pool, `unacknowledged`, `unreleased` and `released`
//! are pairwise disjoint and together hold exactly the identifiers
//! `0..max_packet_identifiers`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace, warn};

use crate::auth::{Principal, PrincipalId, Quota};
use crate::protocol::{Message, QoS, ServerPacket};

/// Broker-scoped session identifier
pub type SessionId = u64;

/// Why a session's handler task is being cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Another connection claimed the same client identifier
    Displaced,
    /// QoS 1/2 output queue overflow or packet-identifier exhaustion
    QueueOverflow,
}

/// Outcome of enqueueing a downstream message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    /// QoS 0 queue was full; the oldest queued message was dropped
    DroppedOldest,
    /// Payload exceeds the principal's maximum packet size
    DroppedOversize,
    /// QoS 1/2 queue overflow; the owner task has been cancelled and the
    /// message was not queued
    Terminated,
}

/// A QoS 1/2 publish waiting in an output queue
#[derive(Debug, Clone)]
struct QueuedPublish {
    packet_id: u16,
    dup: bool,
    message: Message,
}

struct Owner {
    epoch: u64,
    kill: broadcast::Sender<Termination>,
}

struct SessionState {
    connected: bool,
    disconnected_at: Option<Instant>,
    owner: Option<Owner>,
    next_epoch: u64,
    /// Filter -> granted QoS, mirrored in the broker's subscription index
    subscriptions: AHashMap<Arc<str>, QoS>,
    queue_control: VecDeque<ServerPacket>,
    queue_qos0: VecDeque<Message>,
    queue_qos1: VecDeque<QueuedPublish>,
    queue_qos2: VecDeque<QueuedPublish>,
    /// QoS 1 transmit: packet id -> message, awaiting PUBACK
    unacknowledged: BTreeMap<u16, Message>,
    /// QoS 2 transmit: packet id -> message, awaiting PUBREC
    unreleased: BTreeMap<u16, Message>,
    /// QoS 2 transmit: awaiting PUBCOMP
    released: BTreeSet<u16>,
    /// QoS 2 receive: PUBLISH taken but PUBREL not yet seen
    inbound_unreleased: BTreeMap<u16, Message>,
    /// Ordered free packet-identifier pool
    packet_ids: VecDeque<u16>,
    will: Option<Message>,
}

impl SessionState {
    fn has_output(&self) -> bool {
        !self.queue_control.is_empty()
            || !self.queue_qos0.is_empty()
            || !self.queue_qos1.is_empty()
            || !self.queue_qos2.is_empty()
    }

    /// Atomically take the current output. Control packets first, then
    /// publishes in QoS 0, 1, 2 order.
    fn drain(&mut self) -> Vec<ServerPacket> {
        let total = self.queue_control.len()
            + self.queue_qos0.len()
            + self.queue_qos1.len()
            + self.queue_qos2.len();
        let mut out = Vec::with_capacity(total);
        out.extend(self.queue_control.drain(..));
        out.extend(self.queue_qos0.drain(..).map(|message| ServerPacket::Publish {
            packet_id: None,
            dup: false,
            message,
        }));
        out.extend(self.queue_qos1.drain(..).map(QueuedPublish::into_packet));
        out.extend(self.queue_qos2.drain(..).map(QueuedPublish::into_packet));
        out
    }

    fn kill(&self, reason: Termination) {
        if let Some(ref owner) = self.owner {
            let _ = owner.kill.send(reason);
        }
    }
}

impl QueuedPublish {
    fn into_packet(self) -> ServerPacket {
        ServerPacket::Publish {
            packet_id: Some(self.packet_id),
            dup: self.dup,
            message: self.message,
        }
    }
}

/// Per-client session
pub struct Session {
    session_id: SessionId,
    client_identifier: Arc<str>,
    principal_id: PrincipalId,
    clean_session: bool,
    /// Snapshot of the principal taken at session creation; carries the
    /// quota and the permission sets enforced on this session's traffic
    principal: Principal,
    state: Mutex<SessionState>,
    /// Wakes the task blocked in `dequeue`
    output_ready: Notify,
}

impl Session {
    pub(crate) fn new(
        session_id: SessionId,
        client_identifier: Arc<str>,
        principal_id: PrincipalId,
        clean_session: bool,
        principal: Principal,
    ) -> Self {
        let packet_ids = (0..principal.quota.max_packet_identifiers).collect();
        Self {
            session_id,
            client_identifier,
            principal_id,
            clean_session,
            principal,
            state: Mutex::new(SessionState {
                connected: false,
                disconnected_at: None,
                owner: None,
                next_epoch: 0,
                subscriptions: AHashMap::with_capacity(8),
                queue_control: VecDeque::new(),
                queue_qos0: VecDeque::new(),
                queue_qos1: VecDeque::new(),
                queue_qos2: VecDeque::new(),
                unacknowledged: BTreeMap::new(),
                unreleased: BTreeMap::new(),
                released: BTreeSet::new(),
                inbound_unreleased: BTreeMap::new(),
                packet_ids,
                will: None,
            }),
            output_ready: Notify::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_identifier(&self) -> &Arc<str> {
        &self.client_identifier
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn is_clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn quota(&self) -> &Quota {
        &self.principal.quota
    }

    /// Block until at least one output packet is available, then return
    /// the whole current output and leave the queues empty.
    ///
    /// Within a single call, control packets precede publish packets and
    /// publishes appear in QoS 0, 1, 2 order.
    pub async fn dequeue(&self) -> Vec<ServerPacket> {
        loop {
            {
                let mut state = self.state.lock();
                if state.has_output() {
                    return state.drain();
                }
            }
            self.output_ready.notified().await;
        }
    }

    /// Queue a downstream message according to its (already effective) QoS.
    ///
    /// QoS 0 overflow drops the oldest queued message. QoS 1/2 overflow or
    /// packet-identifier exhaustion cancels the owner task; persistent
    /// session state survives, clean sessions are discarded by the broker.
    pub fn enqueue_message(&self, message: Message) -> EnqueueResult {
        if message.payload.len() > self.quota().max_packet_size {
            debug!(
                client = %self.client_identifier,
                topic = %message.topic,
                size = message.payload.len(),
                "dropping oversized message"
            );
            return EnqueueResult::DroppedOversize;
        }

        let result = {
            let mut state = self.state.lock();
            match message.qos {
                QoS::AtMostOnce => {
                    let mut result = EnqueueResult::Enqueued;
                    if state.queue_qos0.len() >= self.quota().max_queue_size_qos0 {
                        state.queue_qos0.pop_front();
                        result = EnqueueResult::DroppedOldest;
                    }
                    state.queue_qos0.push_back(message);
                    result
                }
                QoS::AtLeastOnce => {
                    if state.queue_qos1.len() >= self.quota().max_queue_size_qos1 {
                        warn!(client = %self.client_identifier, "QoS 1 queue overflow");
                        state.kill(Termination::QueueOverflow);
                        return EnqueueResult::Terminated;
                    }
                    let Some(packet_id) = state.packet_ids.pop_front() else {
                        warn!(client = %self.client_identifier, "packet identifiers exhausted");
                        state.kill(Termination::QueueOverflow);
                        return EnqueueResult::Terminated;
                    };
                    state.unacknowledged.insert(packet_id, message.clone());
                    state.queue_qos1.push_back(QueuedPublish {
                        packet_id,
                        dup: false,
                        message,
                    });
                    EnqueueResult::Enqueued
                }
                QoS::ExactlyOnce => {
                    if state.queue_qos2.len() >= self.quota().max_queue_size_qos2 {
                        warn!(client = %self.client_identifier, "QoS 2 queue overflow");
                        state.kill(Termination::QueueOverflow);
                        return EnqueueResult::Terminated;
                    }
                    let Some(packet_id) = state.packet_ids.pop_front() else {
                        warn!(client = %self.client_identifier, "packet identifiers exhausted");
                        state.kill(Termination::QueueOverflow);
                        return EnqueueResult::Terminated;
                    };
                    state.unreleased.insert(packet_id, message.clone());
                    state.queue_qos2.push_back(QueuedPublish {
                        packet_id,
                        dup: false,
                        message,
                    });
                    EnqueueResult::Enqueued
                }
            }
        };
        self.output_ready.notify_one();
        result
    }

    /// PUBACK from the client: complete a QoS 1 transmit. Unknown packet
    /// identifiers are absorbed.
    pub fn process_publish_acknowledged(&self, packet_id: u16) {
        let mut state = self.state.lock();
        if state.unacknowledged.remove(&packet_id).is_some() {
            state.packet_ids.push_back(packet_id);
        } else {
            trace!(client = %self.client_identifier, packet_id, "PUBACK for unknown packet id");
        }
    }

    /// PUBREC from the client: advance a QoS 2 transmit to the released
    /// phase and answer with PUBREL. A duplicate PUBREC re-emits PUBREL.
    pub fn process_publish_received(&self, packet_id: u16) {
        let emitted = {
            let mut state = self.state.lock();
            if state.unreleased.remove(&packet_id).is_some() {
                state.released.insert(packet_id);
                state
                    .queue_control
                    .push_back(ServerPacket::PublishRelease { packet_id });
                true
            } else if state.released.contains(&packet_id) {
                state
                    .queue_control
                    .push_back(ServerPacket::PublishRelease { packet_id });
                true
            } else {
                trace!(client = %self.client_identifier, packet_id, "PUBREC for unknown packet id");
                false
            }
        };
        if emitted {
            self.output_ready.notify_one();
        }
    }

    /// PUBCOMP from the client: finish a QoS 2 transmit, returning the
    /// packet identifier to the free pool. Unknown identifiers are absorbed.
    pub fn process_publish_complete(&self, packet_id: u16) {
        let mut state = self.state.lock();
        if state.released.remove(&packet_id) {
            state.packet_ids.push_back(packet_id);
        } else {
            trace!(client = %self.client_identifier, packet_id, "PUBCOMP for unknown packet id");
        }
    }

    /// PINGREQ from the client
    pub fn process_ping_request(&self) {
        self.state
            .lock()
            .queue_control
            .push_back(ServerPacket::PingResponse);
        self.output_ready.notify_one();
    }

    /// Register an inbound QoS 2 PUBLISH and answer with PUBREC. A
    /// duplicate PUBLISH with the same packet identifier re-emits PUBREC
    /// without replacing the stored message.
    pub(crate) fn register_inbound(&self, packet_id: u16, message: Message) {
        {
            let mut state = self.state.lock();
            state.inbound_unreleased.entry(packet_id).or_insert(message);
            state
                .queue_control
                .push_back(ServerPacket::PublishReceived { packet_id });
        }
        self.output_ready.notify_one();
    }

    /// PUBREL from the client: answer with PUBCOMP and hand back the
    /// stored message, if any, for downstream fan-out.
    pub(crate) fn release_inbound(&self, packet_id: u16) -> Option<Message> {
        let message = {
            let mut state = self.state.lock();
            let message = state.inbound_unreleased.remove(&packet_id);
            state
                .queue_control
                .push_back(ServerPacket::PublishComplete { packet_id });
            message
        };
        self.output_ready.notify_one();
        message
    }

    pub(crate) fn enqueue_control(&self, packet: ServerPacket) {
        self.state.lock().queue_control.push_back(packet);
        self.output_ready.notify_one();
    }

    pub(crate) fn record_subscription(&self, filter: Arc<str>, qos: QoS) {
        self.state.lock().subscriptions.insert(filter, qos);
    }

    pub(crate) fn drop_subscription(&self, filter: &str) -> bool {
        self.state.lock().subscriptions.remove(filter).is_some()
    }

    pub(crate) fn subscription_filters(&self) -> Vec<Arc<str>> {
        self.state.lock().subscriptions.keys().cloned().collect()
    }

    /// Grant ownership to a new handler task, displacing any current
    /// owner. Returns the ownership epoch and the cancellation receiver
    /// the new owner must select against.
    pub(crate) fn attach(&self) -> (u64, broadcast::Receiver<Termination>) {
        let mut state = self.state.lock();
        if let Some(previous) = state.owner.take() {
            debug!(client = %self.client_identifier, "displacing session owner");
            let _ = previous.kill.send(Termination::Displaced);
        }
        let (kill, cancelled) = broadcast::channel(1);
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.owner = Some(Owner { epoch, kill });
        state.connected = true;
        state.disconnected_at = None;
        (epoch, cancelled)
    }

    /// Cancel the current owner task, if any, without granting new
    /// ownership. Used when the broker discards a session outright.
    pub(crate) fn kill_owner(&self, reason: Termination) {
        self.state.lock().kill(reason);
    }

    /// Release ownership. A displaced owner's release does not disturb
    /// the new owner.
    pub(crate) fn detach(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.owner.as_ref().is_some_and(|o| o.epoch == epoch) {
            state.owner = None;
            state.connected = false;
            state.disconnected_at = Some(Instant::now());
        }
    }

    /// Rebuild the output queues from the in-flight registers on
    /// resumption of a persistent session.
    ///
    /// Every unacknowledged or unreleased transmit re-enters its queue as
    /// a duplicate-flagged PUBLISH in packet-id order; every released
    /// packet identifier re-emits PUBREL. The control queue is rebuilt
    /// from scratch: anything a dead connection left there is recoverable
    /// through client retransmission.
    pub(crate) fn resume_in_flight(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.queue_control.clear();
        state.queue_qos1 = state
            .unacknowledged
            .iter()
            .map(|(&packet_id, message)| QueuedPublish {
                packet_id,
                dup: true,
                message: message.clone(),
            })
            .collect();
        state.queue_qos2 = state
            .unreleased
            .iter()
            .map(|(&packet_id, message)| QueuedPublish {
                packet_id,
                dup: true,
                message: message.clone(),
            })
            .collect();
        for &packet_id in &state.released {
            state
                .queue_control
                .push_back(ServerPacket::PublishRelease { packet_id });
        }
        drop(guard);
        self.output_ready.notify_one();
    }

    pub(crate) fn set_will(&self, will: Option<Message>) {
        self.state.lock().will = will;
    }

    pub(crate) fn take_will(&self) -> Option<Message> {
        self.state.lock().will.take()
    }

    /// True when the session is disconnected and has been idle longer
    /// than its quota allows.
    pub(crate) fn expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.connected {
            return false;
        }
        match state.disconnected_at {
            Some(at) => now.duration_since(at) >= self.quota().max_idle_session_ttl,
            None => false,
        }
    }

    /// Snapshot of packet-identifier accounting, for diagnostics and tests
    pub fn packet_id_usage(&self) -> PacketIdUsage {
        let state = self.state.lock();
        PacketIdUsage {
            free: state.packet_ids.iter().copied().collect(),
            unacknowledged: state.unacknowledged.keys().copied().collect(),
            unreleased: state.unreleased.keys().copied().collect(),
            released: state.released.iter().copied().collect(),
        }
    }

    /// Number of packets currently queued for output
    pub fn queued_output(&self) -> usize {
        let state = self.state.lock();
        state.queue_control.len()
            + state.queue_qos0.len()
            + state.queue_qos1.len()
            + state.queue_qos2.len()
    }
}

/// Packet-identifier accounting snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIdUsage {
    pub free: Vec<u16>,
    pub unacknowledged: Vec<u16>,
    pub unreleased: Vec<u16>,
    pub released: Vec<u16>,
}

impl PacketIdUsage {
    /// Every identifier in exactly one register
    pub fn is_partition(&self, max_packet_identifiers: u16) -> bool {
        let mut all: Vec<u16> = self
            .free
            .iter()
            .chain(&self.unacknowledged)
            .chain(&self.unreleased)
            .chain(&self.released)
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all.len() == max_packet_identifiers as usize
            && all == (0..max_packet_identifiers).collect::<Vec<_>>()
    }
}
