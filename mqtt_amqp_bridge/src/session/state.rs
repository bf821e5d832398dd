//! Bookkeeping structures for the per-connection processor state.
//!
//! These carry the ordered-map semantics the QoS-1 paths depend on:
//! publisher confirms settle smallest-sequence-first, and packet
//! identifiers wrap within `[1, 0xFFFF]`.

use std::collections::{BTreeMap, HashMap};

use crate::control_packet::QoS;

/// Allocator for MQTT packet identifiers on outbound publishes.
///
/// Identifiers live in `[1, 0xFFFF]`; after `0xFFFF` the next value is 1.
/// The value 0 is never produced.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: u16,
}

impl MessageIdAllocator {
    /// Take the next identifier and advance.
    pub fn allocate(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    /// The identifier the next [`MessageIdAllocator::allocate`] will return.
    #[must_use]
    pub fn peek(&self) -> u16 {
        self.next
    }

    /// Raise the next identifier to at least `floor`, normalized into the
    /// valid range. Used to start retained-message delivery past the
    /// subscribe packet identifier.
    pub fn raise_to(&mut self, floor: u16) {
        let candidate = self.next.max(floor);
        self.next = if candidate == 0 { 1 } else { candidate };
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

/// Tracking of publisher confirms for the QoS-1 publish channel.
///
/// Sequence numbers are assigned in publish order starting at 1, so the
/// map keys are strictly increasing in insertion order; the broker's
/// confirms arrive in the same order, which makes cumulative settlement
/// a smallest-first sweep.
#[derive(Debug, Default)]
pub struct ConfirmTracker {
    next_seqno: u64,
    unacked: BTreeMap<u64, u16>,
}

impl ConfirmTracker {
    /// A tracker whose first assigned sequence number is 1, matching a
    /// channel freshly put into confirm mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seqno: 1,
            unacked: BTreeMap::new(),
        }
    }

    /// Record an outbound publish carrying `message_id`, returning the
    /// sequence number it was assigned.
    pub fn record(&mut self, message_id: u16) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        self.unacked.insert(seqno, message_id);
        seqno
    }

    /// Settle confirms up to `delivery_tag`.
    ///
    /// With `multiple = false` only the exact tag settles; otherwise every
    /// tracked sequence number `<= delivery_tag` settles smallest-first.
    /// Returns the message identifiers to PUBACK, in insertion order.
    pub fn settle(&mut self, delivery_tag: u64, multiple: bool) -> Vec<u16> {
        if multiple {
            let mut settled = Vec::new();
            while let Some((&seqno, &message_id)) = self.unacked.first_key_value() {
                if seqno > delivery_tag {
                    break;
                }
                self.unacked.remove(&seqno);
                settled.push(message_id);
            }
            settled
        } else {
            self.unacked.remove(&delivery_tag).into_iter().collect()
        }
    }

    /// Number of publishes awaiting confirmation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    /// True if no publishes await confirmation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }
}

/// Tracking of inbound QoS-1 deliveries awaiting a PUBACK from the client.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    awaiting: BTreeMap<u16, u64>,
}

impl DeliveryTracker {
    /// Track a delivery emitted to the client under `message_id`.
    ///
    /// At most one entry exists per identifier; re-use replaces the
    /// previous entry.
    pub fn track(&mut self, message_id: u16, delivery_tag: u64) {
        self.awaiting.insert(message_id, delivery_tag);
    }

    /// Settle a PUBACK from the client, returning the AMQP delivery tag
    /// to acknowledge. `None` for unknown identifiers, which callers
    /// ignore to tolerate misbehaving clients.
    pub fn settle(&mut self, message_id: u16) -> Option<u64> {
        self.awaiting.remove(&message_id)
    }

    /// Number of deliveries awaiting a client PUBACK.
    #[must_use]
    pub fn len(&self) -> usize {
        self.awaiting.len()
    }

    /// True if no deliveries await a client PUBACK.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty()
    }
}

/// Per-topic record of granted subscription QoS values.
///
/// Subscribing prepends without de-duplication; repeated subscribes to
/// the same filter grow the list, and unsubscribe de-duplicates only at
/// removal time. This mirrors the original adapter.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    topics: HashMap<String, Vec<QoS>>,
}

impl SubscriptionTable {
    /// Record a granted subscription for `topic`.
    pub fn add(&mut self, topic: &str, qos: QoS) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(0, qos);
    }

    /// Remove `topic`, returning its recorded QoS values de-duplicated
    /// by ascending sort (one unbind per unique value).
    pub fn remove(&mut self, topic: &str) -> Vec<QoS> {
        let mut qos = self.topics.remove(topic).unwrap_or_default();
        qos.sort_unstable();
        qos.dedup();
        qos
    }

    /// True if the topic currently has at least one recorded subscription.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Topic filters with at least one recorded subscription.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// The recorded QoS list for a topic, newest first.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&[QoS]> {
        self.topics.get(topic).map(Vec::as_slice)
    }
}
