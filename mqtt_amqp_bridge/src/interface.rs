//! Traits and types bounding the external collaborators of the processor.
//!
//! The processor never touches a socket or an AMQP wire connection directly;
//! everything it needs from the environment is expressed here: the AMQP
//! client, the retained-message store, the cluster-wide client-id registry,
//! the access-control subsystem, and the sink for outgoing MQTT frames.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::control_packet::{Packet, Publish};
use crate::error::{AmqpConnectError, AmqpError, TopicAccessError};

/// AMQP header carrying the MQTT publish QoS across the broker
pub const HEADER_PUBLISH_QOS: &str = "x-mqtt-publish-qos";
/// AMQP header carrying the MQTT duplicate-delivery flag across the broker
pub const HEADER_DUP: &str = "x-mqtt-dup";
/// Queue argument bounding the lifetime of an idle QoS-1 queue
pub const QUEUE_ARG_EXPIRES: &str = "x-expires";

/// Subset of AMQP field table values used by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// `byte` field
    Byte(u8),
    /// `bool` field
    Bool(bool),
    /// `long` field
    Long(i64),
}

/// An AMQP field table as an ordered list of name/value pairs
pub type FieldTable = Vec<(String, FieldValue)>;

/// Transport-level facts about the client connection, supplied by the
/// listener that accepted the socket.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Local address the listener is bound to
    pub host: String,
    /// Local listener port (consulted for port-to-vhost mapping)
    pub port: u16,
    /// Peer address of the client socket
    pub peer_host: String,
    /// Peer port of the client socket
    pub peer_port: u16,
    /// Whether the connection arrived over TLS
    pub ssl: bool,
    /// Common name of the TLS client certificate, when one was presented
    pub ssl_login_name: Option<String>,
    /// Client identifier, recorded once CONNECT has been processed
    pub client_id: Option<String>,
}

/// Authenticated identity of a connection after a successful CONNECT.
#[derive(Debug, Clone)]
pub struct AuthState {
    /// Effective username the AMQP connection was opened with
    pub username: String,
    /// Virtual host the connection is scoped to
    pub vhost: String,
}

/// Parameters for opening an authenticated AMQP connection through the
/// in-process (direct) adapter.
#[derive(Debug, Clone)]
pub struct ConnectionParams<'a> {
    /// Effective username
    pub username: &'a str,
    /// Password; `None` when authenticating by TLS certificate
    pub password: Option<&'a Bytes>,
    /// Virtual host to scope the connection to
    pub vhost: &'a str,
    /// Transport facts forwarded as connection metadata
    pub adapter_info: &'a AdapterInfo,
    /// Human-readable MQTT protocol version (e.g. `"3.1.1"`)
    pub protocol_version: &'a str,
}

/// Message published to the AMQP broker on behalf of an MQTT client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpPublish {
    /// Target exchange
    pub exchange: String,
    /// Routing key (the translated MQTT topic)
    pub routing_key: String,
    /// Message headers
    pub headers: FieldTable,
    /// 1 for transient, 2 for persistent
    pub delivery_mode: u8,
    /// Opaque application payload
    pub payload: Bytes,
}

/// A message delivered by the broker on one of the subscription queues.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag of the consumer the delivery arrived on
    pub consumer_tag: String,
    /// Channel-scoped identifier used to acknowledge the delivery
    pub delivery_tag: u64,
    /// Whether the broker flagged the delivery as redelivered
    pub redelivered: bool,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message headers
    pub headers: FieldTable,
    /// Opaque application payload
    pub payload: Bytes,
}

impl Delivery {
    /// The `x-mqtt-publish-qos` header, when present and byte-valued.
    #[must_use]
    pub fn publish_qos_header(&self) -> Option<u8> {
        self.headers.iter().find_map(|(name, value)| {
            if name == HEADER_PUBLISH_QOS {
                match value {
                    FieldValue::Byte(qos) => Some(*qos),
                    FieldValue::Long(qos) => u8::try_from(*qos).ok(),
                    FieldValue::Bool(_) => None,
                }
            } else {
                None
            }
        })
    }

    /// The `x-mqtt-dup` header; absent defaults to `false`.
    #[must_use]
    pub fn dup_header(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            name == HEADER_DUP && matches!(value, FieldValue::Bool(true))
        })
    }
}

/// Asynchronous event surfaced by the AMQP client to the connection's
/// event loop and fed to the processor.
#[derive(Debug, Clone)]
pub enum AmqpEvent {
    /// `basic.deliver` on one of the subscription queue consumers
    Delivery(Delivery),
    /// Publisher confirm (`basic.ack`) from the QoS-1 publish channel
    Confirm {
        /// Sequence number of the confirmed publish
        delivery_tag: u64,
        /// Whether all publishes up to and including `delivery_tag`
        /// are confirmed
        multiple: bool,
    },
}

/// Queue declaration issued by the subscription queue manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclare {
    /// Queue name
    pub queue: String,
    /// Whether the queue survives a broker restart
    pub durable: bool,
    /// Whether the queue is deleted when its last consumer goes away
    pub auto_delete: bool,
    /// Declaration arguments (e.g. `x-expires`)
    pub arguments: FieldTable,
}

/// Entry point to the AMQP client: vhost probing and authenticated
/// connection establishment.
#[async_trait]
pub trait AmqpBackend: Send + Sync {
    /// Connection handle type produced by [`AmqpBackend::connect`]
    type Connection: AmqpConnection<Channel = Self::Channel> + Send + Sync;
    /// Channel handle type produced by the connection
    type Channel: AmqpChannel + Send + Sync;

    /// Return true if the virtual host exists.
    async fn vhost_exists(&self, vhost: &str) -> bool;

    /// Open an authenticated connection.
    ///
    /// # Errors
    /// [`AmqpConnectError`] distinguishing authentication failure from
    /// authorization failure so CONNECT can pick the CONNACK code.
    async fn connect(
        &self,
        params: ConnectionParams<'_>,
    ) -> Result<Self::Connection, AmqpConnectError>;
}

/// An open AMQP connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Channel handle type produced by [`AmqpConnection::open_channel`]
    type Channel;

    /// Open a new channel on this connection.
    ///
    /// # Errors
    /// [`AmqpError`] if the broker refuses the channel.
    async fn open_channel(&self) -> Result<Self::Channel, AmqpError>;

    /// Close the connection.
    ///
    /// # Errors
    /// [`AmqpError`] if the close handshake fails.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open AMQP channel.
///
/// Synchronous AMQP methods (`queue.*`, `basic.qos`, `basic.consume`,
/// `confirm.select`) are `async` and await the broker reply; `basic.publish`
/// and `basic.ack` are fire-and-forget casts and must not block.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Enable credit-flow accounting for deliveries on this channel.
    fn enable_delivery_flow_control(&self);

    /// Acknowledge receipt of one delivery to the flow-control context.
    fn notify_received(&self, delivery_tag: u64);

    /// Declare a queue.
    ///
    /// # Errors
    /// [`AmqpError`] if the declaration is refused.
    async fn queue_declare(&self, declare: QueueDeclare) -> Result<(), AmqpError>;

    /// Passively declare a queue, i.e. check that it already exists.
    ///
    /// # Errors
    /// [`AmqpError::NotFound`] if the queue does not exist. The channel is
    /// unusable afterwards; callers probe on a throwaway channel.
    async fn queue_declare_passive(&self, queue: &str) -> Result<(), AmqpError>;

    /// Delete a queue.
    ///
    /// # Errors
    /// [`AmqpError`] if the deletion is refused or the queue is absent.
    async fn queue_delete(&self, queue: &str) -> Result<(), AmqpError>;

    /// Bind a queue to an exchange with the given routing key.
    ///
    /// # Errors
    /// [`AmqpError`] if the binding is refused.
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Remove a binding previously created with [`AmqpChannel::queue_bind`].
    ///
    /// # Errors
    /// [`AmqpError`] if the unbind is refused.
    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Set the prefetch window for consumers on this channel.
    ///
    /// # Errors
    /// [`AmqpError`] if the broker refuses the setting.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Start a consumer on the queue, returning the consumer tag.
    ///
    /// `no_ack = true` requests automatic acknowledgment.
    ///
    /// # Errors
    /// [`AmqpError`] if the consume request is refused.
    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<String, AmqpError>;

    /// Put the channel into publisher-confirm mode.
    ///
    /// # Errors
    /// [`AmqpError`] if the broker refuses confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publish a message (flow-controlled cast; never blocks).
    fn basic_publish(&self, publish: AmqpPublish);

    /// Acknowledge a delivery (cast; never blocks).
    fn basic_ack(&self, delivery_tag: u64);

    /// Close the channel.
    ///
    /// # Errors
    /// [`AmqpError`] if the close handshake fails.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Per-vhost retained-message store.
#[async_trait]
pub trait RetainStore: Send + Sync {
    /// Store `msg` as the retained message for `topic`, replacing any
    /// previous one.
    async fn retain(&self, topic: &str, msg: Publish);

    /// Remove the retained message for `topic`, if any.
    async fn clear(&self, topic: &str);

    /// Fetch the retained messages matching `topic`.
    async fn fetch(&self, topic: &str) -> Vec<Publish>;
}

/// Lookup of the per-vhost [`RetainStore`] handles.
pub trait RetainerRegistry: Send + Sync {
    /// The retained-message store serving `vhost`.
    fn for_vhost(&self, vhost: &str) -> Arc<dyn RetainStore>;
}

/// Cluster-wide registry of MQTT client identifiers.
#[async_trait]
pub trait ClientIdRegistry: Send + Sync {
    /// Register this connection under `client_id`.
    async fn register(&self, client_id: &str);

    /// Remove the registration for `client_id`. Best effort.
    async fn unregister(&self, client_id: &str);
}

/// Kind of topic operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAccess {
    /// Consuming from a topic (SUBSCRIBE)
    Read,
    /// Publishing to a topic (PUBLISH, will)
    Write,
}

/// Access-control subsystem: user loopback policy and per-topic
/// authorization.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Return true if the user may connect from the peer described by
    /// `adapter_info` (loopback-restricted users may not connect remotely).
    async fn check_user_loopback(&self, username: &str, adapter_info: &AdapterInfo) -> bool;

    /// Check topic access for the authenticated user.
    ///
    /// # Errors
    /// [`TopicAccessError::Refused`] when denied; [`TopicAccessError::Failure`]
    /// when the check itself failed (treated as a refusal by callers).
    async fn check_topic_access(
        &self,
        auth: &AuthState,
        routing_key: &str,
        access: TopicAccess,
    ) -> Result<(), TopicAccessError>;
}

/// Sink for MQTT frames traveling back to the client.
///
/// Implementations hand the packet to the frame serializer; the send is a
/// non-blocking cast from the processor's point of view.
pub trait FrameSink: Send {
    /// Emit one packet toward the client.
    fn send(&self, packet: Packet);
}
