//! Translation between MQTT topic names/filters and AMQP routing/binding keys.
//!
//! MQTT separates topic levels with `/` and uses `+`/`#` as wildcards; AMQP
//! topic exchanges separate words with `.` and use `*`/`#`. The bridge maps
//! between the two on every publish and binding.
//!
//! The mapping is per-character and therefore not injective for names that
//! contain literal `.` or `*` characters; such names round-trip to their
//! translated form. This matches the behavior of the original adapter.

/// MQTT topic level separator
const MQTT_LEVEL_SEPARATOR: char = '/';
/// MQTT single-level wildcard
const MQTT_SINGLE_WILDCARD: char = '+';
/// AMQP routing key word separator
const AMQP_WORD_SEPARATOR: char = '.';
/// AMQP single-word wildcard
const AMQP_SINGLE_WILDCARD: char = '*';

/// Translate an MQTT topic name or filter into an AMQP routing/binding key.
///
/// `/` becomes `.` and `+` becomes `*`; the multi-level wildcard `#` is
/// shared by both syntaxes and passes through unchanged.
#[must_use]
pub fn mqtt_to_amqp(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            MQTT_LEVEL_SEPARATOR => AMQP_WORD_SEPARATOR,
            MQTT_SINGLE_WILDCARD => AMQP_SINGLE_WILDCARD,
            other => other,
        })
        .collect()
}

/// Translate an AMQP routing key back into an MQTT topic name.
///
/// Inverse of [`mqtt_to_amqp`] for keys produced by it.
#[must_use]
pub fn amqp_to_mqtt(routing_key: &str) -> String {
    routing_key
        .chars()
        .map(|c| match c {
            AMQP_WORD_SEPARATOR => MQTT_LEVEL_SEPARATOR,
            AMQP_SINGLE_WILDCARD => MQTT_SINGLE_WILDCARD,
            other => other,
        })
        .collect()
}
