//! The per-connection frame processor.
//!
//! One processor instance owns all state for one MQTT connection. The
//! caller delivers decoded MQTT frames and AMQP client events to it
//! sequentially and owns the socket lifecycle; the processor drives the
//! AMQP channel pair and emits MQTT frames through the [`FrameSink`].

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::auth;
use crate::config::BridgeConfig;
use crate::control_packet::{
    protocol_version_string, ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck,
    Subscribe, Unsubscribe,
};
use crate::error::{AmqpConnectError, TopicAccessError};
use crate::interface::{
    AccessControl, AdapterInfo, AmqpBackend, AmqpChannel, AmqpConnection, AmqpEvent, AmqpPublish,
    AuthState, ClientIdRegistry, ConnectionParams, Delivery, FieldValue, FrameSink, RetainStore,
    RetainerRegistry, TopicAccess, HEADER_DUP, HEADER_PUBLISH_QOS,
};
use crate::session::state::{
    ConfirmTracker, DeliveryTracker, MessageIdAllocator, SubscriptionTable,
};
use crate::session::{queues, ProcessorError, ProcessorErrorKind};
use crate::topic;

/// Protocol levels the bridge accepts (MQTT 3.1 and 3.1.1)
const ACCEPTED_PROTOCOL_LEVELS: [u8; 2] = [3, 4];

/// What the caller should do after a frame has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Keep delivering frames.
    Continue,
    /// CONNECT was accepted; the caller starts the keepalive timer with
    /// the negotiated interval.
    Connected {
        /// Keep-alive interval in seconds, as requested by the client
        keep_alive: u16,
    },
    /// DISCONNECT was received; the session ends and the will must NOT
    /// be published.
    Stop,
}

/// Read-only snapshot of the connection for the introspection surface.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Local address the listener is bound to
    pub host: String,
    /// Local listener port
    pub port: u16,
    /// Peer address of the client socket
    pub peer_host: String,
    /// Peer port of the client socket
    pub peer_port: u16,
    /// Protocol name and human-readable version
    pub protocol: (String, String),
    /// Whether the connection arrived over TLS
    pub ssl: bool,
    /// Common name of the TLS client certificate, when presented
    pub ssl_login_name: Option<String>,
    /// Number of currently open AMQP channels
    pub channels: usize,
    /// MQTT sessions are single-channel
    pub channel_max: u16,
    /// No frame size limit is imposed by the bridge
    pub frame_max: u32,
    /// Client properties reported for the connection
    pub client_properties: Vec<(String, String)>,
}

/// The per-connection MQTT protocol processor.
///
/// All methods take `&mut self`: the processor is a single-threaded actor
/// advanced by discrete events (decoded frames, AMQP deliveries, publisher
/// confirms, lifecycle calls) delivered sequentially by its owner.
pub struct MqttProcessor<B, S>
where
    B: AmqpBackend,
    S: FrameSink,
{
    config: Arc<BridgeConfig>,
    backend: Arc<B>,
    retainers: Arc<dyn RetainerRegistry>,
    registry: Arc<dyn ClientIdRegistry>,
    access: Arc<dyn AccessControl>,
    sink: S,
    adapter_info: AdapterInfo,

    /// AMQP connection; absent until CONNACK-accept
    connection: Option<B::Connection>,
    /// Channel for consuming and QoS-0 publishing
    consume_channel: Option<B::Channel>,
    /// Confirm-mode channel for QoS-1 publishing; opened lazily
    publish_channel: Option<B::Channel>,
    /// Consumer tags indexed by QoS
    consumer_tags: [Option<String>; 2],
    /// Publisher-confirm tracking; present iff `publish_channel` is
    confirms: Option<ConfirmTracker>,
    /// Inbound QoS-1 deliveries awaiting a client PUBACK
    inbound: DeliveryTracker,
    /// Packet identifiers for outbound publishes
    message_id: MessageIdAllocator,
    subscriptions: SubscriptionTable,
    client_id: String,
    clean_session: bool,
    proto_level: Option<u8>,
    will: Option<Publish>,
    retainer: Option<Arc<dyn RetainStore>>,
    auth_state: Option<AuthState>,
}

impl<B, S> MqttProcessor<B, S>
where
    B: AmqpBackend,
    S: FrameSink,
{
    /// Create a processor for a freshly accepted client socket.
    pub fn new(
        config: Arc<BridgeConfig>,
        backend: Arc<B>,
        retainers: Arc<dyn RetainerRegistry>,
        registry: Arc<dyn ClientIdRegistry>,
        access: Arc<dyn AccessControl>,
        sink: S,
        adapter_info: AdapterInfo,
    ) -> Self {
        Self {
            config,
            backend,
            retainers,
            registry,
            access,
            sink,
            adapter_info,
            connection: None,
            consume_channel: None,
            publish_channel: None,
            consumer_tags: [None, None],
            confirms: None,
            inbound: DeliveryTracker::default(),
            message_id: MessageIdAllocator::default(),
            subscriptions: SubscriptionTable::default(),
            client_id: String::new(),
            clean_session: false,
            proto_level: None,
            will: None,
            retainer: None,
            auth_state: None,
        }
    }

    /// Process one decoded frame from the client.
    ///
    /// # Errors
    /// Any [`ProcessorError`] is unrecoverable; the caller closes the
    /// connection (publishing the will first unless the outcome was
    /// [`ProcessOutcome::Stop`] or the error a refused CONNECT).
    pub async fn process_frame(&mut self, packet: Packet) -> Result<ProcessOutcome, ProcessorError> {
        if self.connection.is_none() {
            return match packet {
                Packet::Connect(connect) => self.process_connect(connect).await,
                other => {
                    log::error!("Frame received before CONNECT: {other:?}");
                    Err(ProcessorErrorKind::ConnectExpected.into())
                }
            };
        }
        match packet {
            Packet::Publish(publish) => self.process_publish(publish).await?,
            Packet::PubAck { packet_id } => self.process_puback(packet_id)?,
            Packet::Subscribe(subscribe) => self.process_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.process_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.sink.send(Packet::PingResp),
            Packet::Disconnect => {
                log::debug!("Client {} sent DISCONNECT", self.client_id);
                return Ok(ProcessOutcome::Stop);
            }
            other => {
                log::error!("Unexpected frame on established connection: {other:?}");
                return Err(ProcessorErrorKind::UnexpectedFrame.into());
            }
        }
        Ok(ProcessOutcome::Continue)
    }

    /// Process one event from the AMQP client (a delivery on one of the
    /// subscription queue consumers, or a publisher confirm).
    ///
    /// # Errors
    /// [`ProcessorError`] if the event cannot be handled on the current
    /// channel state.
    pub fn handle_amqp_event(&mut self, event: AmqpEvent) -> Result<(), ProcessorError> {
        match event {
            AmqpEvent::Delivery(delivery) => self.handle_delivery(delivery),
            AmqpEvent::Confirm {
                delivery_tag,
                multiple,
            } => {
                self.handle_confirm(delivery_tag, multiple);
                Ok(())
            }
        }
    }

    // ---------- CONNECT ----------

    async fn process_connect(
        &mut self,
        connect: Connect,
    ) -> Result<ProcessOutcome, ProcessorError> {
        log::debug!(
            "Received CONNECT: client_id={:?}, proto_level={}, clean_session={}",
            connect.client_id,
            connect.proto_level,
            connect.clean_session
        );

        let client_id_provided = !connect.client_id.is_empty();
        let client_id = if client_id_provided {
            connect.client_id.clone()
        } else {
            generate_client_id()
        };
        self.adapter_info.client_id = Some(client_id.clone());

        if !ACCEPTED_PROTOCOL_LEVELS.contains(&connect.proto_level) {
            log::error!(
                "Rejecting CONNECT: unacceptable protocol level {}",
                connect.proto_level
            );
            return self.refuse(ConnectReturnCode::UnacceptableProtocolVersion);
        }
        if !client_id_provided && !connect.clean_session {
            log::error!("Rejecting CONNECT: empty client id with clean_session=false");
            return self.refuse(ConnectReturnCode::IdentifierRejected);
        }

        let creds = match auth::resolve_credentials(
            connect.username.as_deref(),
            connect.password.as_ref(),
            self.adapter_info.ssl_login_name.as_deref(),
            &self.config,
        ) {
            Ok(creds) => creds,
            Err(e) => {
                log::error!("Rejecting CONNECT for {client_id}: {e}");
                return self.refuse(ConnectReturnCode::BadUserNameOrPassword);
            }
        };
        let selection = auth::select_vhost(
            &creds.username,
            self.adapter_info.ssl_login_name.as_deref(),
            self.adapter_info.port,
            &self.config,
        );
        log::debug!(
            "Vhost {} selected for {} via {}",
            selection.vhost,
            selection.username,
            selection.strategy.as_str()
        );
        if !self.backend.vhost_exists(&selection.vhost).await {
            log::error!("Rejecting CONNECT for {client_id}: no vhost {}", selection.vhost);
            return self.refuse(ConnectReturnCode::BadUserNameOrPassword);
        }

        let protocol_version = protocol_version_string(connect.proto_level);
        let connection = match self
            .backend
            .connect(ConnectionParams {
                username: &selection.username,
                password: creds.password.as_ref(),
                vhost: &selection.vhost,
                adapter_info: &self.adapter_info,
                protocol_version,
            })
            .await
        {
            Ok(connection) => connection,
            Err(e @ AmqpConnectError::AuthFailure) => {
                log::error!("Rejecting CONNECT for {client_id}: {e}");
                return self.refuse(ConnectReturnCode::BadUserNameOrPassword);
            }
            Err(e @ (AmqpConnectError::AccessRefused | AmqpConnectError::NotAllowed)) => {
                log::error!("Rejecting CONNECT for {client_id}: {e}");
                return self.refuse(ConnectReturnCode::NotAuthorized);
            }
        };

        if !self
            .access
            .check_user_loopback(&selection.username, &self.adapter_info)
            .await
        {
            log::warn!(
                "Rejecting CONNECT for {client_id}: user {} may only connect via loopback",
                selection.username
            );
            if let Err(e) = connection.close().await {
                log::debug!("Closing refused connection failed: {e}");
            }
            return self.refuse(ConnectReturnCode::NotAuthorized);
        }

        let channel = connection.open_channel().await.map_err(ProcessorErrorKind::from)?;
        channel.enable_delivery_flow_control();

        self.connection = Some(connection);
        self.consume_channel = Some(channel);
        self.client_id = client_id;
        self.clean_session = connect.clean_session;
        self.proto_level = Some(connect.proto_level);
        self.will = connect.will().map(|will| Publish {
            dup: false,
            qos: will.qos.min(QoS::AtLeastOnce),
            retain: will.retain,
            topic: will.topic,
            packet_id: None,
            payload: will.payload,
        });
        self.retainer = Some(self.retainers.for_vhost(&selection.vhost));
        self.auth_state = Some(AuthState {
            username: selection.username,
            vhost: selection.vhost,
        });

        self.registry.register(&self.client_id).await;
        self.require_consume_channel()?
            .basic_qos(self.config.prefetch)
            .await
            .map_err(ProcessorErrorKind::from)?;

        let session_present = self.apply_clean_session_policy().await?;
        self.sink.send(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        }));
        log::info!(
            "Accepted MQTT connection for client {} (protocol {protocol_version}, session_present={session_present})",
            self.client_id
        );
        Ok(ProcessOutcome::Connected {
            keep_alive: connect.keep_alive,
        })
    }

    /// Emit a refusing CONNACK and surface the refusal to the caller.
    /// `session_present` is false on every non-accepted path.
    fn refuse(&mut self, code: ConnectReturnCode) -> Result<ProcessOutcome, ProcessorError> {
        self.sink.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }));
        Err(ProcessorErrorKind::ConnectionRefused(code).into())
    }

    /// Apply the clean-session policy to the QoS-1 queue, returning the
    /// `session_present` flag for the CONNACK.
    async fn apply_clean_session_policy(&mut self) -> Result<bool, ProcessorError> {
        let queue = queues::queue_name(&self.client_id, 1);
        if self.clean_session {
            // Best-effort delete of any leftover durable queue. Failures
            // must never prevent the CONNACK, so the delete runs on a
            // throwaway channel and errors are swallowed.
            match self.require_connection()?.open_channel().await {
                Ok(channel) => {
                    if let Err(e) = channel.queue_delete(&queue).await {
                        log::debug!("Clean-session delete of {queue} failed: {e}");
                    }
                    if let Err(e) = channel.close().await {
                        log::debug!("Closing clean-session channel failed: {e}");
                    }
                }
                Err(e) => log::debug!("Clean-session channel open failed: {e}"),
            }
            return Ok(false);
        }
        // The session is present iff the QoS-1 queue already existed. The
        // passive probe kills its channel on failure, so it gets a
        // throwaway channel too; only then is the queue ensured.
        let session_present = match self.require_connection()?.open_channel().await {
            Ok(channel) => {
                let present = channel.queue_declare_passive(&queue).await.is_ok();
                if let Err(e) = channel.close().await {
                    log::debug!("Closing session-probe channel failed: {e}");
                }
                present
            }
            Err(e) => {
                log::debug!("Session-probe channel open failed: {e}");
                false
            }
        };
        self.ensure_queue(1).await?;
        Ok(session_present)
    }

    // ---------- Subscription management ----------

    /// Make sure the subscription queue for the QoS level exists and has
    /// an active consumer, returning the queue name.
    async fn ensure_queue(&mut self, qos: u8) -> Result<String, ProcessorError> {
        let queue = queues::queue_name(&self.client_id, qos);
        if self.consumer_tags[usize::from(qos)].is_some() {
            return Ok(queue);
        }
        let declare = if qos == 0 {
            queues::qos0_declare(&self.client_id)
        } else {
            queues::qos1_declare(
                &self.client_id,
                self.clean_session,
                self.config.subscription_ttl,
            )
        };
        let channel = self.require_consume_channel()?;
        channel
            .queue_declare(declare)
            .await
            .map_err(ProcessorErrorKind::from)?;
        let tag = channel
            .basic_consume(&queue, qos == 0)
            .await
            .map_err(ProcessorErrorKind::from)?;
        log::debug!("Consuming {queue} with tag {tag}");
        self.consumer_tags[usize::from(qos)] = Some(tag);
        Ok(queue)
    }

    async fn process_subscribe(&mut self, subscribe: Subscribe) -> Result<(), ProcessorError> {
        // Authorization first: any denied filter aborts the whole
        // SUBSCRIBE before any queue state changes.
        for entry in &subscribe.topics {
            self.check_topic_access(&entry.topic_filter, TopicAccess::Read)
                .await?;
        }

        let mut granted = Vec::with_capacity(subscribe.topics.len());
        for entry in &subscribe.topics {
            // QoS-2 requests are granted as QoS-1
            let qos = entry.qos.min(QoS::AtLeastOnce);
            let queue = self.ensure_queue(qos.as_u8()).await?;
            let routing_key = topic::mqtt_to_amqp(&entry.topic_filter);
            self.require_consume_channel()?
                .queue_bind(&queue, self.config.exchange(), &routing_key)
                .await
                .map_err(ProcessorErrorKind::from)?;
            self.subscriptions.add(&entry.topic_filter, qos);
            granted.push(qos);
        }
        self.sink.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            granted,
        }));
        self.send_retained(&subscribe).await;
        Ok(())
    }

    /// Deliver retained messages for freshly subscribed filters.
    async fn send_retained(&mut self, subscribe: &Subscribe) {
        let Some(retainer) = self.retainer.clone() else {
            return;
        };
        // Start past the subscribe packet identifier so retained
        // deliveries cannot collide with it.
        self.message_id.raise_to(subscribe.packet_id);
        for entry in &subscribe.topics {
            let sub_qos = entry.qos.min(QoS::AtLeastOnce);
            for msg in retainer.fetch(&entry.topic_filter).await {
                let qos = sub_qos.min(msg.qos);
                let packet_id = if qos == QoS::AtMostOnce {
                    None
                } else {
                    Some(self.message_id.allocate())
                };
                self.sink.send(Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain: true,
                    topic: msg.topic,
                    packet_id,
                    payload: msg.payload,
                }));
            }
        }
    }

    async fn process_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ProcessorError> {
        for topic_filter in &unsubscribe.topics {
            let routing_key = topic::mqtt_to_amqp(topic_filter);
            let qos_levels = self.subscriptions.remove(topic_filter);
            for qos in qos_levels {
                let queue = queues::queue_name(&self.client_id, qos.as_u8());
                self.require_consume_channel()?
                    .queue_unbind(&queue, self.config.exchange(), &routing_key)
                    .await
                    .map_err(ProcessorErrorKind::from)?;
            }
        }
        self.sink.send(Packet::UnsubAck {
            packet_id: unsubscribe.packet_id,
        });
        Ok(())
    }

    // ---------- Outbound publishing (client -> AMQP) ----------

    async fn process_publish(&mut self, mut publish: Publish) -> Result<(), ProcessorError> {
        // Native QoS 2 is not supported: downgrade before any further
        // processing.
        if publish.qos == QoS::ExactlyOnce {
            publish.qos = QoS::AtLeastOnce;
        }
        self.check_topic_access(&publish.topic, TopicAccess::Write)
            .await?;
        self.publish_message(&publish).await
    }

    /// Publish a message to the exchange and maintain the retained store,
    /// shared by PUBLISH processing and will publication.
    async fn publish_message(&mut self, publish: &Publish) -> Result<(), ProcessorError> {
        let amqp_publish = AmqpPublish {
            exchange: self.config.exchange().to_string(),
            routing_key: topic::mqtt_to_amqp(&publish.topic),
            headers: vec![
                (
                    HEADER_PUBLISH_QOS.to_string(),
                    FieldValue::Byte(publish.qos.as_u8()),
                ),
                (HEADER_DUP.to_string(), FieldValue::Bool(publish.dup)),
            ],
            delivery_mode: if publish.qos == QoS::AtMostOnce { 1 } else { 2 },
            payload: publish.payload.clone(),
        };
        if publish.qos == QoS::AtMostOnce {
            self.require_consume_channel()?.basic_publish(amqp_publish);
        } else {
            self.ensure_publish_channel().await?;
            if let (Some(confirms), Some(packet_id)) =
                (self.confirms.as_mut(), publish.packet_id)
            {
                let seqno = confirms.record(packet_id);
                log::debug!("Publish {packet_id} awaiting confirm seqno {seqno}");
            }
            self.require_publish_channel()?.basic_publish(amqp_publish);
        }

        if publish.retain {
            if let Some(retainer) = self.retainer.clone() {
                if publish.payload.is_empty() {
                    retainer.clear(&publish.topic).await;
                } else {
                    retainer.retain(&publish.topic, publish.clone()).await;
                }
            }
        }
        Ok(())
    }

    /// Lazily open the QoS-1 publish channel with publisher confirms
    /// enabled. No other channel uses confirm mode.
    async fn ensure_publish_channel(&mut self) -> Result<(), ProcessorError> {
        if self.publish_channel.is_some() {
            return Ok(());
        }
        let channel = self
            .require_connection()?
            .open_channel()
            .await
            .map_err(ProcessorErrorKind::from)?;
        channel
            .confirm_select()
            .await
            .map_err(ProcessorErrorKind::from)?;
        self.publish_channel = Some(channel);
        self.confirms = Some(ConfirmTracker::new());
        Ok(())
    }

    // ---------- Inbound deliveries (AMQP -> client) ----------

    fn handle_delivery(&mut self, delivery: Delivery) -> Result<(), ProcessorError> {
        self.require_consume_channel()?
            .notify_received(delivery.delivery_tag);

        let dup = delivery.redelivered || delivery.dup_header();
        let (delivery_qos, sub_qos) =
            if self.consumer_tags[0].as_deref() == Some(delivery.consumer_tag.as_str()) {
                (QoS::AtMostOnce, QoS::AtMostOnce)
            } else if self.consumer_tags[1].as_deref() == Some(delivery.consumer_tag.as_str()) {
                let qos = match delivery.publish_qos_header() {
                    Some(0) => QoS::AtMostOnce,
                    // Anything above 1 was downgraded on the way in
                    _ => QoS::AtLeastOnce,
                };
                (qos, QoS::AtLeastOnce)
            } else {
                log::warn!(
                    "Dropping delivery on unknown consumer tag {}",
                    delivery.consumer_tag
                );
                return Ok(());
            };

        // A duplicate that the client would see at QoS 0 cannot be told
        // apart from the first delivery; suppress it instead of
        // re-publishing.
        if dup && delivery_qos == QoS::AtMostOnce {
            if sub_qos == QoS::AtLeastOnce {
                self.require_consume_channel()?.basic_ack(delivery.delivery_tag);
            }
            return Ok(());
        }

        let packet_id = if delivery_qos == QoS::AtLeastOnce {
            Some(self.message_id.allocate())
        } else {
            None
        };
        self.sink.send(Packet::Publish(Publish {
            dup,
            qos: delivery_qos,
            retain: false,
            topic: topic::amqp_to_mqtt(&delivery.routing_key),
            packet_id,
            payload: delivery.payload,
        }));

        match (delivery_qos, sub_qos) {
            // Delivered at QoS 0 from the QoS-1 queue: no PUBACK will
            // come from the client, so settle with the broker now.
            (QoS::AtMostOnce, QoS::AtLeastOnce) => {
                self.require_consume_channel()?.basic_ack(delivery.delivery_tag);
            }
            (QoS::AtLeastOnce, QoS::AtLeastOnce) => {
                if let Some(packet_id) = packet_id {
                    self.inbound.track(packet_id, delivery.delivery_tag);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Publisher confirm from the broker: emit PUBACKs toward the client
    /// for every settled publish, in publish order.
    fn handle_confirm(&mut self, delivery_tag: u64, multiple: bool) {
        let Some(confirms) = self.confirms.as_mut() else {
            log::warn!("Publisher confirm without an open confirm channel");
            return;
        };
        for packet_id in confirms.settle(delivery_tag, multiple) {
            self.sink.send(Packet::PubAck { packet_id });
        }
    }

    fn process_puback(&mut self, packet_id: u16) -> Result<(), ProcessorError> {
        match self.inbound.settle(packet_id) {
            Some(delivery_tag) => {
                self.require_consume_channel()?.basic_ack(delivery_tag);
            }
            // Tolerate bogus clients and QoS-downgraded deliveries
            None => log::debug!("Ignoring PUBACK for untracked packet id {packet_id}"),
        }
        Ok(())
    }

    // ---------- Lifecycle ----------

    /// Publish the will message, if one was declared, then close the
    /// channel pair. Called by the owner on ungraceful session end.
    pub async fn send_will(&mut self) {
        if let Some(will) = self.will.take() {
            match self
                .check_topic_access(&will.topic, TopicAccess::Write)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.publish_message(&will).await {
                        log::error!("Will publish for {} failed: {e}", self.client_id);
                    }
                }
                Err(e) => {
                    log::warn!("Skipping will publish for {}: {e}", self.client_id);
                }
            }
        }
        if let Some(channel) = self.publish_channel.take() {
            if let Err(e) = channel.close().await {
                log::debug!("Closing publish channel failed: {e}");
            }
        }
        if let Some(channel) = self.consume_channel.take() {
            if let Err(e) = channel.close().await {
                log::debug!("Closing consume channel failed: {e}");
            }
        }
    }

    /// Tear down the AMQP connection. Idempotent and infallible; all
    /// failures are swallowed because the socket is going away regardless.
    pub async fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            if !self.client_id.is_empty() {
                self.registry.unregister(&self.client_id).await;
            }
            if let Err(e) = connection.close().await {
                log::debug!("Closing AMQP connection failed: {e}");
            }
        }
    }

    // ---------- Introspection ----------

    /// The client identifier (empty before CONNECT).
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the CONNECT handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether the client requested a clean session.
    #[must_use]
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Human-readable MQTT protocol version (`"N/A"` before CONNECT).
    #[must_use]
    pub fn protocol_version(&self) -> &'static str {
        self.proto_level.map_or("N/A", protocol_version_string)
    }

    /// The packet identifier the next outbound QoS-1 publish will use.
    #[must_use]
    pub fn next_message_id(&self) -> u16 {
        self.message_id.peek()
    }

    /// Number of outbound publishes awaiting a publisher confirm.
    #[must_use]
    pub fn pending_confirm_count(&self) -> usize {
        self.confirms.as_ref().map_or(0, ConfirmTracker::len)
    }

    /// Number of inbound deliveries awaiting a client PUBACK.
    #[must_use]
    pub fn pending_puback_count(&self) -> usize {
        self.inbound.len()
    }

    /// Topic filters with at least one active subscription.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.topics().map(str::to_string).collect()
    }

    /// Whether the topic filter currently has a subscription.
    #[must_use]
    pub fn is_subscribed(&self, topic_filter: &str) -> bool {
        self.subscriptions.contains(topic_filter)
    }

    /// Connection facts for the introspection surface.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let channels =
            usize::from(self.consume_channel.is_some()) + usize::from(self.publish_channel.is_some());
        let mut client_properties = Vec::new();
        if !self.client_id.is_empty() {
            client_properties.push(("client_id".to_string(), self.client_id.clone()));
        }
        ConnectionInfo {
            host: self.adapter_info.host.clone(),
            port: self.adapter_info.port,
            peer_host: self.adapter_info.peer_host.clone(),
            peer_port: self.adapter_info.peer_port,
            protocol: ("MQTT".to_string(), self.protocol_version().to_string()),
            ssl: self.adapter_info.ssl,
            ssl_login_name: self.adapter_info.ssl_login_name.clone(),
            channels,
            channel_max: 1,
            frame_max: 0,
            client_properties,
        }
    }

    // ---------- Helpers ----------

    fn require_connection(&self) -> Result<&B::Connection, ProcessorError> {
        self.connection
            .as_ref()
            .ok_or_else(|| ProcessorErrorKind::ConnectExpected.into())
    }

    fn require_consume_channel(&self) -> Result<&B::Channel, ProcessorError> {
        self.consume_channel
            .as_ref()
            .ok_or_else(|| ProcessorErrorKind::ConnectExpected.into())
    }

    fn require_publish_channel(&self) -> Result<&B::Channel, ProcessorError> {
        self.publish_channel
            .as_ref()
            .ok_or_else(|| ProcessorErrorKind::ConnectExpected.into())
    }

    /// Check topic access, coercing any access-control failure to a
    /// refusal.
    async fn check_topic_access(
        &self,
        topic: &str,
        access: TopicAccess,
    ) -> Result<(), ProcessorError> {
        let Some(auth_state) = &self.auth_state else {
            return Err(ProcessorErrorKind::ConnectExpected.into());
        };
        let routing_key = topic::mqtt_to_amqp(topic);
        match self
            .access
            .check_topic_access(auth_state, &routing_key, access)
            .await
        {
            Ok(()) => Ok(()),
            Err(TopicAccessError::Refused) => {
                log::warn!(
                    "{access:?} access to topic {topic} refused for user {}",
                    auth_state.username
                );
                Err(ProcessorErrorKind::Unauthorized {
                    topic: topic.to_string(),
                    access,
                }
                .into())
            }
            Err(TopicAccessError::Failure(reason)) => {
                log::error!("Topic access check failed, treating as refusal: {reason}");
                Err(ProcessorErrorKind::Unauthorized {
                    topic: topic.to_string(),
                    access,
                }
                .into())
            }
        }
    }
}

/// A fresh client identifier for clients that connected with an empty one.
fn generate_client_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("mqtt-client-{suffix}")
}
