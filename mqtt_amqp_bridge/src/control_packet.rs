//! MQTT 3.1/3.1.1 control packet model.
//!
//! These are the decoded frames exchanged with the upstream reader/serializer.
//! The wire codec itself lives outside this crate; it produces and consumes
//! the types defined here.

use bytes::Bytes;
use thiserror::Error;

/// Protocol level carried by an MQTT 3.1 CONNECT packet
pub const PROTOCOL_LEVEL_3_1: u8 = 3;
/// Protocol level carried by an MQTT 3.1.1 CONNECT packet
pub const PROTOCOL_LEVEL_3_1_1: u8 = 4;

/// Human-readable protocol version for a CONNECT protocol level.
#[must_use]
pub fn protocol_version_string(proto_level: u8) -> &'static str {
    match proto_level {
        PROTOCOL_LEVEL_3_1 => "3.1.0",
        PROTOCOL_LEVEL_3_1_1 => "3.1.1",
        _ => "N/A",
    }
}

/// Quality of Service levels
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery, acknowledged by a PUBACK packet
    AtLeastOnce = 1,
    /// Exactly once delivery (not natively supported by the bridge;
    /// downgraded to [`QoS::AtLeastOnce`] on receipt)
    ExactlyOnce = 2,
}

impl QoS {
    /// The numeric QoS value as carried on the wire.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Error converting a raw byte into a [`QoS`]
#[derive(Error, Debug)]
#[error("invalid QoS value: {0}")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

/// Decoded MQTT control packets
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    /// Client request to connect to the broker
    Connect(Connect),
    /// Connect acknowledgment
    ConnAck(ConnAck),
    /// Publish message
    Publish(Publish),
    /// Publish acknowledgment
    PubAck {
        /// Packet identifier of the PUBLISH being acknowledged
        packet_id: u16,
    },
    /// Client subscribe request
    Subscribe(Subscribe),
    /// Subscribe acknowledgment
    SubAck(SubAck),
    /// Client unsubscribe request
    Unsubscribe(Unsubscribe),
    /// Unsubscribe acknowledgment
    UnsubAck {
        /// Packet identifier of the UNSUBSCRIBE being acknowledged
        packet_id: u16,
    },
    /// PING request
    PingReq,
    /// PING response
    PingResp,
    /// Client is disconnecting
    Disconnect,
}

/// Client request to connect to the broker
#[derive(Debug, PartialEq, Clone)]
pub struct Connect {
    /// Protocol level from the variable header (3 for 3.1, 4 for 3.1.1)
    pub proto_level: u8,
    /// Whether the broker should discard any existing session state
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    /// Identifies the client to the broker; may be empty
    pub client_id: String,
    /// Will message to be published by the broker on ungraceful disconnect
    pub last_will: Option<LastWill>,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<Bytes>,
}

/// Will message declared in the CONNECT variable header
#[derive(Debug, PartialEq, Clone)]
pub struct LastWill {
    /// QoS level to be used when publishing the will
    pub qos: QoS,
    /// Whether the will is to be retained when published
    pub retain: bool,
    /// Topic the will is published to
    pub topic: String,
    /// Application message published to the will topic
    pub payload: Bytes,
}

impl Connect {
    /// Extract the will message from the CONNECT variable header, if the
    /// will flag was set.
    #[must_use]
    pub fn will(&self) -> Option<LastWill> {
        self.last_will.clone()
    }
}

/// Connect acknowledgment
#[derive(Debug, PartialEq, Clone)]
pub struct ConnAck {
    /// Whether the broker already holds session state for this client
    pub session_present: bool,
    /// Outcome of the connection request
    pub code: ConnectReturnCode,
}

/// CONNACK return code
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted = 0,
    /// The broker does not support the level of the MQTT protocol
    /// requested by the client
    UnacceptableProtocolVersion = 1,
    /// The client identifier is correct UTF-8 but not allowed
    IdentifierRejected = 2,
    /// The network connection has been made but the MQTT service
    /// is unavailable
    ServiceUnavailable = 3,
    /// The data in the user name or password is malformed
    BadUserNameOrPassword = 4,
    /// The client is not authorized to connect
    NotAuthorized = 5,
}

/// Publish message (in either direction)
#[derive(Debug, PartialEq, Clone)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name the message is published to
    pub topic: String,
    /// Packet identifier; present iff `qos` > 0
    pub packet_id: Option<u16>,
    /// Opaque application payload
    pub payload: Bytes,
}

/// Client subscribe request
#[derive(Debug, PartialEq, Clone)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Requested topic filters with their requested QoS, in packet order
    pub topics: Vec<SubscribeTopic>,
}

/// A single topic filter entry of a SUBSCRIBE packet
#[derive(Debug, PartialEq, Clone)]
pub struct SubscribeTopic {
    /// The topic filter to subscribe to
    pub topic_filter: String,
    /// The maximum QoS requested for the subscription
    pub qos: QoS,
}

/// Subscribe acknowledgment
#[derive(Debug, PartialEq, Clone)]
pub struct SubAck {
    /// Packet identifier of the SUBSCRIBE being acknowledged
    pub packet_id: u16,
    /// Granted QoS per requested filter, in request order
    pub granted: Vec<QoS>,
}

/// Client unsubscribe request
#[derive(Debug, PartialEq, Clone)]
pub struct Unsubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters to unsubscribe from
    pub topics: Vec<String>,
}
