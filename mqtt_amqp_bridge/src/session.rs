//! Per-connection MQTT session: the protocol processor bridging one MQTT
//! client to the AMQP broker.

mod processor;
mod queues;
mod state;

use thiserror::Error;

pub use processor::{ConnectionInfo, MqttProcessor, ProcessOutcome};
pub use queues::{queue_name, queue_names};

use crate::control_packet::ConnectReturnCode;
use crate::error::AmqpError;
use crate::interface::TopicAccess;

/// Error type for the processor. The type of error is specified by the
/// value of [`ProcessorErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ProcessorError(#[from] ProcessorErrorKind);

impl ProcessorError {
    /// The kind of failure.
    #[must_use]
    pub fn kind(&self) -> &ProcessorErrorKind {
        &self.0
    }
}

/// Error kind for [`ProcessorError`].
///
/// Every variant is unrecoverable from the processor's point of view; the
/// caller owns the socket lifecycle and closes the connection. Recoverable
/// conditions never surface here; they are answered in band with MQTT
/// frames.
#[derive(Debug, Error)]
pub enum ProcessorErrorKind {
    /// A non-CONNECT frame arrived on a fresh connection.
    #[error("expected CONNECT frame before any other")]
    ConnectExpected,
    /// CONNECT was refused; the CONNACK carrying this code has already
    /// been emitted.
    #[error("connection refused with CONNACK code {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    /// A topic access check failed on PUBLISH or SUBSCRIBE.
    #[error("{access:?} access to topic {topic} refused")]
    Unauthorized {
        /// The MQTT topic that was checked
        topic: String,
        /// Whether read or write access was requested
        access: TopicAccess,
    },
    /// A frame that is never client-to-server (or a second CONNECT)
    /// arrived on an established connection.
    #[error("frame not valid on an established connection")]
    UnexpectedFrame,
    /// An AMQP operation against the broker failed.
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}
