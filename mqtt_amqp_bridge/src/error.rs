//! Common error types for the AMQP and access-control boundaries.

use thiserror::Error;

/// Error opening an authenticated AMQP connection.
///
/// The variants are distinguishable so the CONNECT path can emit the
/// correct CONNACK return code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmqpConnectError {
    /// The credentials were rejected by the broker
    #[error("authentication failure")]
    AuthFailure,
    /// The authenticated user may not access the requested vhost
    #[error("access to vhost refused")]
    AccessRefused,
    /// The connection is not allowed for this user
    #[error("connection not allowed")]
    NotAllowed,
}

/// Error performing an AMQP operation on an open connection or channel.
#[derive(Debug, Error, Clone)]
pub enum AmqpError {
    /// The channel was closed by the broker, usually in response to a
    /// failed synchronous operation
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    /// The named resource does not exist (e.g. a passive declare on an
    /// absent queue)
    #[error("no such resource: {0}")]
    NotFound(String),
    /// Any other failure reported by the AMQP client
    #[error("operation failed: {0}")]
    Operation(String),
}

/// Error from a topic access check.
#[derive(Debug, Error, Clone)]
pub enum TopicAccessError {
    /// The user is not permitted to perform the requested operation on
    /// the topic
    #[error("access refused")]
    Refused,
    /// The access-control subsystem failed; callers coerce this to a
    /// refusal
    #[error("access check failed: {0}")]
    Failure(String),
}
