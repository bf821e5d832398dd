//! Bespoke mocks for the traits defined in the interface module.
//!
//! Every mock records the calls made against it so tests can assert on the
//! exact AMQP traffic a frame sequence produces. The broker mock also
//! carries just enough state (vhosts, queues) to exercise the
//! session-present and clean-session paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::control_packet::{Packet, Publish};
use crate::error::{AmqpConnectError, AmqpError, TopicAccessError};
use crate::interface::{
    AccessControl, AdapterInfo, AmqpBackend, AmqpChannel, AmqpConnection, AmqpPublish, AuthState,
    ClientIdRegistry, ConnectionParams, FrameSink, QueueDeclare, RetainStore, RetainerRegistry,
    TopicAccess,
};

/// One operation recorded by the [`MockBroker`].
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    /// An authenticated connection was opened
    ConnectionOpened {
        /// Effective username the connection was opened with
        username: String,
        /// Selected vhost
        vhost: String,
        /// Reported protocol version
        protocol_version: String,
    },
    /// A channel was opened (numbered from 1 per connection order)
    ChannelOpened {
        /// Channel number
        channel: usize,
    },
    /// Delivery flow control was enabled on a channel
    FlowControlEnabled {
        /// Channel number
        channel: usize,
    },
    /// Receipt of a delivery was acknowledged to the flow-control context
    NotifyReceived {
        /// Channel number
        channel: usize,
        /// Delivery tag of the received delivery
        delivery_tag: u64,
    },
    /// `queue.declare`
    QueueDeclare {
        /// Channel number
        channel: usize,
        /// The declaration
        declare: QueueDeclare,
    },
    /// `queue.declare` with `passive = true`
    QueueDeclarePassive {
        /// Channel number
        channel: usize,
        /// Probed queue name
        queue: String,
        /// Whether the queue existed
        existed: bool,
    },
    /// `queue.delete`
    QueueDelete {
        /// Channel number
        channel: usize,
        /// Deleted queue name
        queue: String,
    },
    /// `queue.bind`
    QueueBind {
        /// Channel number
        channel: usize,
        /// Bound queue
        queue: String,
        /// Source exchange
        exchange: String,
        /// Binding key
        routing_key: String,
    },
    /// `queue.unbind`
    QueueUnbind {
        /// Channel number
        channel: usize,
        /// Unbound queue
        queue: String,
        /// Source exchange
        exchange: String,
        /// Binding key
        routing_key: String,
    },
    /// `basic.qos`
    BasicQos {
        /// Channel number
        channel: usize,
        /// Prefetch window
        prefetch: u16,
    },
    /// `basic.consume`
    BasicConsume {
        /// Channel number
        channel: usize,
        /// Consumed queue
        queue: String,
        /// Whether automatic acknowledgment was requested
        no_ack: bool,
        /// Tag assigned to the consumer
        consumer_tag: String,
    },
    /// `confirm.select`
    ConfirmSelect {
        /// Channel number
        channel: usize,
    },
    /// `basic.publish`
    BasicPublish {
        /// Channel number
        channel: usize,
        /// The published message
        publish: AmqpPublish,
    },
    /// `basic.ack`
    BasicAck {
        /// Channel number
        channel: usize,
        /// Acknowledged delivery tag
        delivery_tag: u64,
    },
    /// `channel.close`
    ChannelClosed {
        /// Channel number
        channel: usize,
    },
    /// `connection.close`
    ConnectionClosed,
}

struct BrokerInner {
    vhosts: Mutex<HashSet<String>>,
    queues: Mutex<HashSet<String>>,
    connect_error: Mutex<Option<AmqpConnectError>>,
    ops: Mutex<Vec<BrokerOp>>,
    channel_counter: AtomicUsize,
    consumer_counter: AtomicUsize,
}

/// Mock AMQP backend recording every operation performed against it.
///
/// All operations succeed unless a failure is injected. Cloning shares the
/// recorded state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl MockBroker {
    /// A broker knowing only the default vhost `/`.
    #[must_use]
    pub fn new() -> Self {
        let mut vhosts = HashSet::new();
        vhosts.insert("/".to_string());
        Self {
            inner: Arc::new(BrokerInner {
                vhosts: Mutex::new(vhosts),
                queues: Mutex::new(HashSet::new()),
                connect_error: Mutex::new(None),
                ops: Mutex::new(Vec::new()),
                channel_counter: AtomicUsize::new(0),
                consumer_counter: AtomicUsize::new(0),
            }),
        }
    }

    /// Make `vhost` known to the broker.
    pub fn add_vhost(&self, vhost: &str) {
        self.inner.vhosts.lock().unwrap().insert(vhost.to_string());
    }

    /// Pre-create a queue, as if left behind by a previous session.
    pub fn add_queue(&self, queue: &str) {
        self.inner.queues.lock().unwrap().insert(queue.to_string());
    }

    /// Whether the queue currently exists on the broker.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.queues.lock().unwrap().contains(queue)
    }

    /// Make the next connection attempt fail with `error`.
    pub fn fail_connect_with(&self, error: AmqpConnectError) {
        *self.inner.connect_error.lock().unwrap() = Some(error);
    }

    /// Snapshot of every recorded operation, in call order.
    #[must_use]
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.inner.ops.lock().unwrap().clone()
    }

    /// Drop all recorded operations.
    pub fn clear_ops(&self) {
        self.inner.ops.lock().unwrap().clear();
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn record(&self, op: BrokerOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl AmqpBackend for MockBroker {
    type Connection = MockConnection;
    type Channel = MockChannel;

    async fn vhost_exists(&self, vhost: &str) -> bool {
        self.inner.vhosts.lock().unwrap().contains(vhost)
    }

    async fn connect(
        &self,
        params: ConnectionParams<'_>,
    ) -> Result<Self::Connection, AmqpConnectError> {
        if let Some(error) = self.inner.connect_error.lock().unwrap().take() {
            return Err(error);
        }
        self.inner.record(BrokerOp::ConnectionOpened {
            username: params.username.to_string(),
            vhost: params.vhost.to_string(),
            protocol_version: params.protocol_version.to_string(),
        });
        Ok(MockConnection {
            inner: self.inner.clone(),
        })
    }
}

/// Connection handle produced by [`MockBroker`].
pub struct MockConnection {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<Self::Channel, AmqpError> {
        let number = self.inner.channel_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.record(BrokerOp::ChannelOpened { channel: number });
        Ok(MockChannel {
            number,
            inner: self.inner.clone(),
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::ConnectionClosed);
        Ok(())
    }
}

/// Channel handle produced by [`MockConnection`].
pub struct MockChannel {
    number: usize,
    inner: Arc<BrokerInner>,
}

impl MockChannel {
    /// The channel number assigned at open time (1-based).
    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn enable_delivery_flow_control(&self) {
        self.inner.record(BrokerOp::FlowControlEnabled {
            channel: self.number,
        });
    }

    fn notify_received(&self, delivery_tag: u64) {
        self.inner.record(BrokerOp::NotifyReceived {
            channel: self.number,
            delivery_tag,
        });
    }

    async fn queue_declare(&self, declare: QueueDeclare) -> Result<(), AmqpError> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .insert(declare.queue.clone());
        self.inner.record(BrokerOp::QueueDeclare {
            channel: self.number,
            declare,
        });
        Ok(())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<(), AmqpError> {
        let existed = self.inner.queues.lock().unwrap().contains(queue);
        self.inner.record(BrokerOp::QueueDeclarePassive {
            channel: self.number,
            queue: queue.to_string(),
            existed,
        });
        if existed {
            Ok(())
        } else {
            Err(AmqpError::NotFound(queue.to_string()))
        }
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), AmqpError> {
        let existed = self.inner.queues.lock().unwrap().remove(queue);
        self.inner.record(BrokerOp::QueueDelete {
            channel: self.number,
            queue: queue.to_string(),
        });
        if existed {
            Ok(())
        } else {
            Err(AmqpError::NotFound(queue.to_string()))
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::QueueBind {
            channel: self.number,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::QueueUnbind {
            channel: self.number,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::BasicQos {
            channel: self.number,
            prefetch: prefetch_count,
        });
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<String, AmqpError> {
        let n = self.inner.consumer_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let consumer_tag = format!("ctag-{n}");
        self.inner.record(BrokerOp::BasicConsume {
            channel: self.number,
            queue: queue.to_string(),
            no_ack,
            consumer_tag: consumer_tag.clone(),
        });
        Ok(consumer_tag)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::ConfirmSelect {
            channel: self.number,
        });
        Ok(())
    }

    fn basic_publish(&self, publish: AmqpPublish) {
        self.inner.record(BrokerOp::BasicPublish {
            channel: self.number,
            publish,
        });
    }

    fn basic_ack(&self, delivery_tag: u64) {
        self.inner.record(BrokerOp::BasicAck {
            channel: self.number,
            delivery_tag,
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.record(BrokerOp::ChannelClosed {
            channel: self.number,
        });
        Ok(())
    }
}

/// Frame sink that records every packet emitted toward the client.
#[derive(Clone, Default)]
pub struct MockFrameSink {
    sent: Arc<Mutex<Vec<Packet>>>,
}

impl MockFrameSink {
    /// A sink with no recorded frames.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the emitted frames, in emission order.
    #[must_use]
    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    /// Take the emitted frames, leaving the sink empty.
    #[must_use]
    pub fn take(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl FrameSink for MockFrameSink {
    fn send(&self, packet: Packet) {
        self.sent.lock().unwrap().push(packet);
    }
}

/// One operation recorded by a [`MockRetainStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainOp {
    /// A message was retained for the topic
    Retain(String),
    /// The retained message for the topic was cleared
    Clear(String),
    /// The retained messages for the topic were fetched
    Fetch(String),
}

/// Mock retained-message store with exact-topic matching.
#[derive(Default)]
pub struct MockRetainStore {
    messages: Mutex<HashMap<String, Publish>>,
    ops: Mutex<Vec<RetainOp>>,
}

impl MockRetainStore {
    /// Seed a retained message for `topic`.
    pub fn preload(&self, topic: &str, msg: Publish) {
        self.messages.lock().unwrap().insert(topic.to_string(), msg);
    }

    /// The currently retained message for `topic`, if any.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Publish> {
        self.messages.lock().unwrap().get(topic).cloned()
    }

    /// Snapshot of the recorded operations, in call order.
    #[must_use]
    pub fn ops(&self) -> Vec<RetainOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetainStore for MockRetainStore {
    async fn retain(&self, topic: &str, msg: Publish) {
        self.ops
            .lock()
            .unwrap()
            .push(RetainOp::Retain(topic.to_string()));
        self.messages.lock().unwrap().insert(topic.to_string(), msg);
    }

    async fn clear(&self, topic: &str) {
        self.ops
            .lock()
            .unwrap()
            .push(RetainOp::Clear(topic.to_string()));
        self.messages.lock().unwrap().remove(topic);
    }

    async fn fetch(&self, topic: &str) -> Vec<Publish> {
        self.ops
            .lock()
            .unwrap()
            .push(RetainOp::Fetch(topic.to_string()));
        self.messages
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .into_iter()
            .collect()
    }
}

/// Mock retainer registry handing out one [`MockRetainStore`] per vhost.
#[derive(Clone, Default)]
pub struct MockRetainerRegistry {
    stores: Arc<Mutex<HashMap<String, Arc<MockRetainStore>>>>,
}

impl MockRetainerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `vhost`, created on first use.
    #[must_use]
    pub fn store(&self, vhost: &str) -> Arc<MockRetainStore> {
        self.stores
            .lock()
            .unwrap()
            .entry(vhost.to_string())
            .or_default()
            .clone()
    }
}

impl RetainerRegistry for MockRetainerRegistry {
    fn for_vhost(&self, vhost: &str) -> Arc<dyn RetainStore> {
        self.store(vhost)
    }
}

/// One event recorded by the [`MockClientIdRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A client identifier was registered
    Registered(String),
    /// A client identifier was unregistered
    Unregistered(String),
}

/// Mock cluster-wide client-id registry.
#[derive(Clone, Default)]
pub struct MockClientIdRegistry {
    events: Arc<Mutex<Vec<RegistryEvent>>>,
}

impl MockClientIdRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded registration events, in call order.
    #[must_use]
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientIdRegistry for MockClientIdRegistry {
    async fn register(&self, client_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RegistryEvent::Registered(client_id.to_string()));
    }

    async fn unregister(&self, client_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RegistryEvent::Unregistered(client_id.to_string()));
    }
}

struct AccessInner {
    loopback_ok: Mutex<bool>,
    denied_read: Mutex<HashSet<String>>,
    denied_write: Mutex<HashSet<String>>,
    failure: Mutex<Option<String>>,
}

/// Mock access-control subsystem.
///
/// Everything is allowed by default; denials are keyed by AMQP routing
/// key (the translated topic).
#[derive(Clone)]
pub struct MockAccessControl {
    inner: Arc<AccessInner>,
}

impl MockAccessControl {
    /// An access-control mock that allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AccessInner {
                loopback_ok: Mutex::new(true),
                denied_read: Mutex::new(HashSet::new()),
                denied_write: Mutex::new(HashSet::new()),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Refuse the loopback check for every user.
    pub fn deny_loopback(&self) {
        *self.inner.loopback_ok.lock().unwrap() = false;
    }

    /// Deny read access to the routing key.
    pub fn deny_read(&self, routing_key: &str) {
        self.inner
            .denied_read
            .lock()
            .unwrap()
            .insert(routing_key.to_string());
    }

    /// Deny write access to the routing key.
    pub fn deny_write(&self, routing_key: &str) {
        self.inner
            .denied_write
            .lock()
            .unwrap()
            .insert(routing_key.to_string());
    }

    /// Make every topic access check fail (not refuse) with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.inner.failure.lock().unwrap() = Some(reason.to_string());
    }
}

impl Default for MockAccessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessControl for MockAccessControl {
    async fn check_user_loopback(&self, _username: &str, _adapter_info: &AdapterInfo) -> bool {
        *self.inner.loopback_ok.lock().unwrap()
    }

    async fn check_topic_access(
        &self,
        _auth: &AuthState,
        routing_key: &str,
        access: TopicAccess,
    ) -> Result<(), TopicAccessError> {
        if let Some(reason) = self.inner.failure.lock().unwrap().clone() {
            return Err(TopicAccessError::Failure(reason));
        }
        let denied = match access {
            TopicAccess::Read => self.inner.denied_read.lock().unwrap().contains(routing_key),
            TopicAccess::Write => self.inner.denied_write.lock().unwrap().contains(routing_key),
        };
        if denied {
            Err(TopicAccessError::Refused)
        } else {
            Ok(())
        }
    }
}
