//! Naming and declaration of the per-client subscription queues.
//!
//! Every client owns up to two queues, one per supported QoS level. The
//! names are a deterministic function of the client identifier so that a
//! reconnecting client finds its QoS-1 queue again.

use crate::interface::{FieldValue, QueueDeclare, QUEUE_ARG_EXPIRES};

/// Name of the subscription queue for `client_id` at the given QoS level
/// (0 or 1). The two names differ for every client identifier and are
/// stable across reconnects.
#[must_use]
pub fn queue_name(client_id: &str, qos: u8) -> String {
    format!("mqtt-subscription-{client_id}qos{qos}")
}

/// Both subscription queue names for `client_id`, as `(qos0, qos1)`.
#[must_use]
pub fn queue_names(client_id: &str) -> (String, String) {
    (queue_name(client_id, 0), queue_name(client_id, 1))
}

/// Declaration for the QoS-0 queue: transient and removed with its
/// consumer.
#[must_use]
pub fn qos0_declare(client_id: &str) -> QueueDeclare {
    QueueDeclare {
        queue: queue_name(client_id, 0),
        durable: false,
        auto_delete: true,
        arguments: Vec::new(),
    }
}

/// Declaration for the QoS-1 queue: durable, auto-deleted only for
/// clean sessions, and expiring after `subscription_ttl` milliseconds of
/// disuse for non-clean sessions when a ttl is configured.
#[must_use]
pub fn qos1_declare(
    client_id: &str,
    clean_session: bool,
    subscription_ttl: Option<u64>,
) -> QueueDeclare {
    let mut arguments = Vec::new();
    if !clean_session {
        if let Some(ttl_ms) = subscription_ttl {
            arguments.push((
                QUEUE_ARG_EXPIRES.to_string(),
                FieldValue::Long(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
            ));
        }
    }
    QueueDeclare {
        queue: queue_name(client_id, 1),
        durable: true,
        auto_delete: clean_session,
        arguments,
    }
}
