//! Decoded packet types exchanged between the core and the wire layer

use std::sync::Arc;

use bytes::Bytes;

use super::{ConnectReturnCode, QoS};

/// An application message
///
/// The topic uses `Arc<str>` for efficient fan-out: routing a message to
/// many sessions clones the topic in O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name (no wildcards)
    pub topic: Arc<str>,
    /// Payload
    pub payload: Bytes,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// One entry of a SUBSCRIBE packet: topic filter plus requested QoS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub filter: String,
    pub qos: QoS,
}

impl SubscribeRequest {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// Decoded packets produced by a session, drained via `Session::dequeue`
/// and written to the wire by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// PUBLISH. `packet_id` is `None` for QoS 0 deliveries.
    Publish {
        packet_id: Option<u16>,
        dup: bool,
        message: Message,
    },
    /// PUBACK (QoS 1 receive path)
    PublishAcknowledged { packet_id: u16 },
    /// PUBREC (QoS 2 receive path, step 1)
    PublishReceived { packet_id: u16 },
    /// PUBREL (QoS 2 transmit path, step 2)
    PublishRelease { packet_id: u16 },
    /// PUBCOMP (QoS 2 receive path, step 3)
    PublishComplete { packet_id: u16 },
    /// SUBACK. One grant per requested filter; `None` encodes failure (0x80).
    SubscribeAcknowledged {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// UNSUBACK
    UnsubscribeAcknowledged { packet_id: u16 },
    /// PINGRESP
    PingResponse,
    /// CONNACK
    ConnectionAcknowledged {
        session_present: bool,
        return_code: ConnectReturnCode,
    },
}
