//! End-to-end processor scenarios driven through the interface mocks.

use std::sync::Arc;

use bytes::Bytes;

use mqtt_amqp_bridge::control_packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeTopic, Unsubscribe,
};
use mqtt_amqp_bridge::error::AmqpConnectError;
use mqtt_amqp_bridge::interface::{
    AdapterInfo, AmqpEvent, Delivery, FieldTable, FieldValue, QueueDeclare, HEADER_DUP,
    HEADER_PUBLISH_QOS, QUEUE_ARG_EXPIRES,
};
use mqtt_amqp_bridge::interface_mocks::{
    BrokerOp, MockAccessControl, MockBroker, MockClientIdRegistry, MockFrameSink,
    MockRetainerRegistry, RegistryEvent, RetainOp,
};
use mqtt_amqp_bridge::session::{queue_name, MqttProcessor, ProcessOutcome, ProcessorErrorKind};
use mqtt_amqp_bridge::{BridgeConfig, BridgeConfigBuilder};

const CLIENT_ID: &str = "client-1";

struct Harness {
    processor: MqttProcessor<MockBroker, MockFrameSink>,
    broker: MockBroker,
    sink: MockFrameSink,
    retainers: MockRetainerRegistry,
    registry: MockClientIdRegistry,
    access: MockAccessControl,
}

fn default_config() -> BridgeConfig {
    BridgeConfigBuilder::default()
        .default_user(Some("guest".to_string()))
        .default_pass(Some("guest".to_string()))
        .build()
        .unwrap()
}

fn adapter_info() -> AdapterInfo {
    AdapterInfo {
        host: "127.0.0.1".to_string(),
        port: 1883,
        peer_host: "127.0.0.1".to_string(),
        peer_port: 52000,
        ssl: false,
        ssl_login_name: None,
        client_id: None,
    }
}

fn harness_with(config: BridgeConfig) -> Harness {
    let broker = MockBroker::new();
    let sink = MockFrameSink::new();
    let retainers = MockRetainerRegistry::new();
    let registry = MockClientIdRegistry::new();
    let access = MockAccessControl::new();
    let processor = MqttProcessor::new(
        Arc::new(config),
        Arc::new(broker.clone()),
        Arc::new(retainers.clone()),
        Arc::new(registry.clone()),
        Arc::new(access.clone()),
        sink.clone(),
        adapter_info(),
    );
    Harness {
        processor,
        broker,
        sink,
        retainers,
        registry,
        access,
    }
}

fn harness() -> Harness {
    harness_with(default_config())
}

fn connect_frame(client_id: &str, clean_session: bool) -> Packet {
    Packet::Connect(Connect {
        proto_level: 4,
        clean_session,
        keep_alive: 60,
        client_id: client_id.to_string(),
        last_will: None,
        username: None,
        password: None,
    })
}

fn subscribe_frame(packet_id: u16, topics: &[(&str, QoS)]) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id,
        topics: topics
            .iter()
            .map(|(topic_filter, qos)| SubscribeTopic {
                topic_filter: (*topic_filter).to_string(),
                qos: *qos,
            })
            .collect(),
    })
}

fn publish_frame(
    topic: &str,
    qos: QoS,
    packet_id: Option<u16>,
    retain: bool,
    payload: &'static [u8],
) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::from_static(payload),
    })
}

fn delivery_event(
    consumer_tag: &str,
    delivery_tag: u64,
    routing_key: &str,
    headers: FieldTable,
    redelivered: bool,
) -> AmqpEvent {
    AmqpEvent::Delivery(Delivery {
        consumer_tag: consumer_tag.to_string(),
        delivery_tag,
        redelivered,
        routing_key: routing_key.to_string(),
        headers,
        payload: Bytes::from_static(b"payload"),
    })
}

/// Connect the harness with the given clean-session flag, then drop the
/// frames and broker traffic the handshake produced.
async fn connected(clean_session: bool) -> Harness {
    let mut h = harness();
    let outcome = h
        .processor
        .process_frame(connect_frame(CLIENT_ID, clean_session))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Connected { .. }));
    h.broker.clear_ops();
    let _ = h.sink.take();
    h
}

fn consumer_tag_for(broker: &MockBroker, queue: &str) -> String {
    broker
        .ops()
        .into_iter()
        .find_map(|op| match op {
            BrokerOp::BasicConsume {
                queue: q,
                consumer_tag,
                ..
            } if q == queue => Some(consumer_tag),
            _ => None,
        })
        .expect("no consumer started on queue")
}

fn confirm_channel(broker: &MockBroker) -> usize {
    broker
        .ops()
        .into_iter()
        .find_map(|op| match op {
            BrokerOp::ConfirmSelect { channel } => Some(channel),
            _ => None,
        })
        .expect("no channel in confirm mode")
}

// ---------- CONNECT ----------

#[tokio::test]
async fn frames_before_connect_are_rejected() {
    for packet in [
        Packet::PingReq,
        publish_frame("a/b", QoS::AtMostOnce, None, false, b"x"),
        subscribe_frame(1, &[("a/b", QoS::AtMostOnce)]),
    ] {
        let mut h = harness();
        let err = h.processor.process_frame(packet).await.unwrap_err();
        assert!(matches!(err.kind(), ProcessorErrorKind::ConnectExpected));
        assert!(h.sink.sent().is_empty());
    }
}

#[tokio::test]
async fn connect_happy_path_with_generated_client_id() {
    let mut h = harness();
    let outcome = h
        .processor
        .process_frame(connect_frame("", true))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Connected { keep_alive: 60 });

    assert_eq!(
        h.sink.sent(),
        vec![Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        })]
    );
    let client_id = h.processor.client_id().to_string();
    assert!(!client_id.is_empty());
    assert!(h.processor.is_connected());
    assert_eq!(h.processor.protocol_version(), "3.1.1");
    assert_eq!(
        h.registry.events(),
        vec![RegistryEvent::Registered(client_id.clone())]
    );

    let ops = h.broker.ops();
    assert!(ops.contains(&BrokerOp::ConnectionOpened {
        username: "guest".to_string(),
        vhost: "/".to_string(),
        protocol_version: "3.1.1".to_string(),
    }));
    // Consume channel is the first one opened, with flow control and the
    // configured prefetch window.
    assert!(ops.contains(&BrokerOp::FlowControlEnabled { channel: 1 }));
    assert!(ops.contains(&BrokerOp::BasicQos {
        channel: 1,
        prefetch: 10,
    }));
    // Clean session: the QoS-1 queue is deleted on a throwaway channel.
    assert!(ops.contains(&BrokerOp::QueueDelete {
        channel: 2,
        queue: queue_name(&client_id, 1),
    }));
    assert!(ops.contains(&BrokerOp::ChannelClosed { channel: 2 }));
}

#[tokio::test]
async fn connect_with_explicit_credentials_and_vhost_in_username() {
    let mut h = harness();
    h.broker.add_vhost("v1");
    let outcome = h
        .processor
        .process_frame(Packet::Connect(Connect {
            proto_level: 3,
            clean_session: true,
            keep_alive: 30,
            client_id: CLIENT_ID.to_string(),
            last_will: None,
            username: Some("v1:u1".to_string()),
            password: Some(Bytes::from_static(b"pw")),
        }))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Connected { keep_alive: 30 });
    assert_eq!(h.processor.protocol_version(), "3.1.0");
    assert!(h.broker.ops().contains(&BrokerOp::ConnectionOpened {
        username: "u1".to_string(),
        vhost: "v1".to_string(),
        protocol_version: "3.1.0".to_string(),
    }));
}

#[tokio::test]
async fn connect_unacceptable_protocol_level() {
    for proto_level in [0, 2, 5] {
        let mut h = harness();
        let err = h
            .processor
            .process_frame(Packet::Connect(Connect {
                proto_level,
                clean_session: true,
                keep_alive: 60,
                client_id: CLIENT_ID.to_string(),
                last_will: None,
                username: None,
                password: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ProcessorErrorKind::ConnectionRefused(
                ConnectReturnCode::UnacceptableProtocolVersion
            )
        ));
        assert_eq!(
            h.sink.sent(),
            vec![Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::UnacceptableProtocolVersion,
            })]
        );
        assert!(!h.processor.is_connected());
    }
}

#[tokio::test]
async fn connect_empty_client_id_with_persistent_session_rejected() {
    let mut h = harness();
    let err = h
        .processor
        .process_frame(connect_frame("", false))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::IdentifierRejected)
    ));
    assert_eq!(
        h.sink.sent(),
        vec![Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::IdentifierRejected,
        })]
    );
}

#[tokio::test]
async fn connect_with_lone_username_rejected() {
    let mut h = harness();
    let err = h
        .processor
        .process_frame(Packet::Connect(Connect {
            proto_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: CLIENT_ID.to_string(),
            last_will: None,
            username: Some("u".to_string()),
            password: None,
        }))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::BadUserNameOrPassword)
    ));
}

#[tokio::test]
async fn connect_unknown_vhost_rejected() {
    let mut h = harness();
    // "vX" is not a vhost the broker knows
    let err = h
        .processor
        .process_frame(Packet::Connect(Connect {
            proto_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: CLIENT_ID.to_string(),
            last_will: None,
            username: Some("vX:u".to_string()),
            password: Some(Bytes::from_static(b"pw")),
        }))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::BadUserNameOrPassword)
    ));
}

#[tokio::test]
async fn connect_broker_auth_failure_maps_to_bad_credentials() {
    let mut h = harness();
    h.broker.fail_connect_with(AmqpConnectError::AuthFailure);
    let err = h
        .processor
        .process_frame(connect_frame(CLIENT_ID, true))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::BadUserNameOrPassword)
    ));
}

#[tokio::test]
async fn connect_broker_authz_failure_maps_to_not_authorized() {
    for error in [AmqpConnectError::AccessRefused, AmqpConnectError::NotAllowed] {
        let mut h = harness();
        h.broker.fail_connect_with(error);
        let err = h
            .processor
            .process_frame(connect_frame(CLIENT_ID, true))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::NotAuthorized)
        ));
        assert_eq!(
            h.sink.sent(),
            vec![Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            })]
        );
    }
}

#[tokio::test]
async fn connect_loopback_refusal_closes_amqp_connection() {
    let mut h = harness();
    h.access.deny_loopback();
    let err = h
        .processor
        .process_frame(connect_frame(CLIENT_ID, true))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ProcessorErrorKind::ConnectionRefused(ConnectReturnCode::NotAuthorized)
    ));
    assert!(h.broker.ops().contains(&BrokerOp::ConnectionClosed));
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let mut h = connected(true).await;
    let err = h
        .processor
        .process_frame(connect_frame(CLIENT_ID, true))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ProcessorErrorKind::UnexpectedFrame));
}

// ---------- Clean-session policy ----------

#[tokio::test]
async fn session_present_when_qos1_queue_survives() {
    let mut h = harness();
    h.broker.add_queue(&queue_name(CLIENT_ID, 1));
    h.processor
        .process_frame(connect_frame(CLIENT_ID, false))
        .await
        .unwrap();
    assert_eq!(
        h.sink.sent(),
        vec![Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Accepted,
        })]
    );
    // The probe ran passively on a throwaway channel before the queue was
    // (re)declared on the consume channel.
    let ops = h.broker.ops();
    assert!(ops.contains(&BrokerOp::QueueDeclarePassive {
        channel: 2,
        queue: queue_name(CLIENT_ID, 1),
        existed: true,
    }));
    assert!(ops.contains(&BrokerOp::ChannelClosed { channel: 2 }));
}

#[tokio::test]
async fn session_absent_for_fresh_persistent_session() {
    let mut h = harness();
    h.processor
        .process_frame(connect_frame(CLIENT_ID, false))
        .await
        .unwrap();
    assert_eq!(
        h.sink.sent(),
        vec![Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        })]
    );
    // A persistent session eagerly sets up its QoS-1 queue and consumer.
    let queue = queue_name(CLIENT_ID, 1);
    let ops = h.broker.ops();
    assert!(ops.iter().any(|op| matches!(
        op,
        BrokerOp::BasicConsume { queue: q, no_ack: false, .. } if *q == queue
    )));
}

#[tokio::test]
async fn clean_session_ignores_delete_failure() {
    // No leftover queue exists, so the delete fails; CONNACK must still
    // be accepted.
    let mut h = harness();
    let outcome = h
        .processor
        .process_frame(connect_frame(CLIENT_ID, true))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Connected { .. }));
    assert_eq!(
        h.sink.sent(),
        vec![Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        })]
    );
}

// ---------- SUBSCRIBE / UNSUBSCRIBE ----------

#[tokio::test]
async fn subscribe_declares_binds_and_acks_in_order() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(
            7,
            &[
                ("a/b", QoS::AtLeastOnce),
                ("c", QoS::AtMostOnce),
                ("d/e", QoS::ExactlyOnce),
            ],
        ))
        .await
        .unwrap();

    // QoS 2 is granted as QoS 1; the response list is in request order.
    assert_eq!(
        h.sink.sent(),
        vec![Packet::SubAck(SubAck {
            packet_id: 7,
            granted: vec![QoS::AtLeastOnce, QoS::AtMostOnce, QoS::AtLeastOnce],
        })]
    );

    let q0 = queue_name(CLIENT_ID, 0);
    let q1 = queue_name(CLIENT_ID, 1);
    let ops = h.broker.ops();
    // The QoS-0 consumer auto-acks, the QoS-1 consumer does not.
    assert!(ops.iter().any(|op| matches!(
        op,
        BrokerOp::BasicConsume { queue, no_ack: true, .. } if *queue == q0
    )));
    assert!(ops.iter().any(|op| matches!(
        op,
        BrokerOp::BasicConsume { queue, no_ack: false, .. } if *queue == q1
    )));
    // Bindings carry the translated routing keys.
    assert!(ops.contains(&BrokerOp::QueueBind {
        channel: 1,
        queue: q1.clone(),
        exchange: "amq.topic".to_string(),
        routing_key: "a.b".to_string(),
    }));
    assert!(ops.contains(&BrokerOp::QueueBind {
        channel: 1,
        queue: q0.clone(),
        exchange: "amq.topic".to_string(),
        routing_key: "c".to_string(),
    }));
    assert!(ops.contains(&BrokerOp::QueueBind {
        channel: 1,
        queue: q1,
        exchange: "amq.topic".to_string(),
        routing_key: "d.e".to_string(),
    }));
    assert!(h.processor.is_subscribed("a/b"));
    assert!(h.processor.is_subscribed("c"));
}

#[tokio::test]
async fn qos1_queue_flags_depend_on_clean_session() {
    // Persistent session: durable, not auto-deleted, with the configured
    // expiry.
    let mut h = connected(false).await;
    h.broker.clear_ops();
    h.processor
        .process_frame(subscribe_frame(1, &[("t", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    // Queue was already declared during CONNECT; the consumer is active,
    // so no re-declaration happens on subscribe.
    assert!(!h
        .broker
        .ops()
        .iter()
        .any(|op| matches!(op, BrokerOp::QueueDeclare { .. })));

    // Clean session: auto-deleted and without expiry.
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("t", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    let declare = h
        .broker
        .ops()
        .into_iter()
        .find_map(|op| match op {
            BrokerOp::QueueDeclare { declare, .. } => Some(declare),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        declare,
        QueueDeclare {
            queue: queue_name(CLIENT_ID, 1),
            durable: true,
            auto_delete: true,
            arguments: vec![],
        }
    );
}

#[tokio::test]
async fn persistent_qos1_queue_carries_expiry() {
    let mut h = harness();
    h.processor
        .process_frame(connect_frame(CLIENT_ID, false))
        .await
        .unwrap();
    let declare = h
        .broker
        .ops()
        .into_iter()
        .find_map(|op| match op {
            BrokerOp::QueueDeclare { declare, .. } => Some(declare),
            _ => None,
        })
        .unwrap();
    assert!(declare.durable);
    assert!(!declare.auto_delete);
    assert_eq!(
        declare.arguments,
        vec![(QUEUE_ARG_EXPIRES.to_string(), FieldValue::Long(86_400_000))]
    );
}

#[tokio::test]
async fn subscribe_unauthorized_aborts_whole_request() {
    let mut h = connected(true).await;
    h.access.deny_read("b.c");
    let err = h
        .processor
        .process_frame(subscribe_frame(
            3,
            &[("a", QoS::AtMostOnce), ("b/c", QoS::AtMostOnce)],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ProcessorErrorKind::Unauthorized { .. }));
    // Nothing was declared, bound, or acknowledged.
    assert!(h.sink.sent().is_empty());
    assert!(h.broker.ops().is_empty());
}

#[tokio::test]
async fn unsubscribe_reverses_subscribe() {
    let mut h = connected(true).await;
    // Two subscribes to the same filter at different QoS levels.
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtMostOnce)]))
        .await
        .unwrap();
    h.processor
        .process_frame(subscribe_frame(2, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .process_frame(Packet::Unsubscribe(Unsubscribe {
            packet_id: 3,
            topics: vec!["a/b".to_string()],
        }))
        .await
        .unwrap();

    assert_eq!(h.sink.sent(), vec![Packet::UnsubAck { packet_id: 3 }]);
    // Exactly one unbind per QoS level that was bound, in ascending order.
    assert_eq!(
        h.broker.ops(),
        vec![
            BrokerOp::QueueUnbind {
                channel: 1,
                queue: queue_name(CLIENT_ID, 0),
                exchange: "amq.topic".to_string(),
                routing_key: "a.b".to_string(),
            },
            BrokerOp::QueueUnbind {
                channel: 1,
                queue: queue_name(CLIENT_ID, 1),
                exchange: "amq.topic".to_string(),
                routing_key: "a.b".to_string(),
            },
        ]
    );
    assert!(!h.processor.is_subscribed("a/b"));
}

#[tokio::test]
async fn unsubscribe_unknown_topic_still_acks() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(Packet::Unsubscribe(Unsubscribe {
            packet_id: 9,
            topics: vec!["never/subscribed".to_string()],
        }))
        .await
        .unwrap();
    assert_eq!(h.sink.sent(), vec![Packet::UnsubAck { packet_id: 9 }]);
    assert!(h.broker.ops().is_empty());
}

// ---------- Retained messages ----------

#[tokio::test]
async fn subscribe_delivers_retained_qos0_message() {
    let mut h = connected(true).await;
    h.retainers.store("/").preload(
        "a/b",
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        },
    );
    let before = h.processor.next_message_id();

    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();

    let frames = h.sink.sent();
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0],
        Packet::SubAck(SubAck {
            packet_id: 1,
            granted: vec![QoS::AtLeastOnce],
        })
    );
    // Retained delivery at min(subscribe QoS, message QoS) = 0: no packet
    // id is consumed.
    assert_eq!(
        frames[1],
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        })
    );
    assert_eq!(h.processor.next_message_id(), before);
}

#[tokio::test]
async fn subscribe_delivers_retained_qos1_past_subscribe_packet_id() {
    let mut h = connected(true).await;
    h.retainers.store("/").preload(
        "a/b",
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        },
    );

    h.processor
        .process_frame(subscribe_frame(10, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();

    let frames = h.sink.sent();
    // The retained publish takes an id at or past the subscribe packet id.
    assert_eq!(
        frames[1],
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: Some(10),
            payload: Bytes::from_static(b"x"),
        })
    );
    assert_eq!(h.processor.next_message_id(), 11);
}

// ---------- Outbound publishing ----------

#[tokio::test]
async fn qos0_publish_uses_consume_channel() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(publish_frame("a/b", QoS::AtMostOnce, None, false, b"hi"))
        .await
        .unwrap();

    let ops = h.broker.ops();
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        BrokerOp::BasicPublish { channel, publish } => {
            assert_eq!(*channel, 1);
            assert_eq!(publish.exchange, "amq.topic");
            assert_eq!(publish.routing_key, "a.b");
            assert_eq!(publish.delivery_mode, 1);
            assert_eq!(
                publish.headers,
                vec![
                    (HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(0)),
                    (HEADER_DUP.to_string(), FieldValue::Bool(false)),
                ]
            );
        }
        other => panic!("unexpected op: {other:?}"),
    }
    assert_eq!(h.processor.pending_confirm_count(), 0);
}

#[tokio::test]
async fn qos1_publish_confirm_roundtrip() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(publish_frame("a/b", QoS::AtLeastOnce, Some(42), false, b"m"))
        .await
        .unwrap();

    // A second channel is lazily opened in confirm mode.
    let channel = confirm_channel(&h.broker);
    let ops = h.broker.ops();
    assert!(ops.contains(&BrokerOp::ConfirmSelect { channel }));
    assert!(ops.iter().any(|op| matches!(
        op,
        BrokerOp::BasicPublish { channel: c, publish }
            if *c == channel && publish.delivery_mode == 2
    )));
    assert_eq!(h.processor.pending_confirm_count(), 1);
    // No PUBACK yet.
    assert!(h.sink.sent().is_empty());

    // The broker confirms seqno 1; the client gets its PUBACK.
    h.processor
        .handle_amqp_event(AmqpEvent::Confirm {
            delivery_tag: 1,
            multiple: false,
        })
        .unwrap();
    assert_eq!(h.sink.sent(), vec![Packet::PubAck { packet_id: 42 }]);
    assert_eq!(h.processor.pending_confirm_count(), 0);
}

#[tokio::test]
async fn qos2_publish_downgrades_to_qos1() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(publish_frame("a/b", QoS::ExactlyOnce, Some(5), false, b"m"))
        .await
        .unwrap();

    let channel = confirm_channel(&h.broker);
    assert!(h.broker.ops().iter().any(|op| matches!(
        op,
        BrokerOp::BasicPublish { channel: c, publish }
            if *c == channel
                && publish.headers.contains(&(HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(1)))
    )));
    assert_eq!(h.processor.pending_confirm_count(), 1);

    h.processor
        .handle_amqp_event(AmqpEvent::Confirm {
            delivery_tag: 1,
            multiple: false,
        })
        .unwrap();
    assert_eq!(h.sink.sent(), vec![Packet::PubAck { packet_id: 5 }]);
}

#[tokio::test]
async fn cumulative_confirm_acks_in_order() {
    let mut h = connected(true).await;
    for packet_id in [10, 11, 12] {
        h.processor
            .process_frame(publish_frame(
                "a/b",
                QoS::AtLeastOnce,
                Some(packet_id),
                false,
                b"m",
            ))
            .await
            .unwrap();
    }
    assert_eq!(h.processor.pending_confirm_count(), 3);

    h.processor
        .handle_amqp_event(AmqpEvent::Confirm {
            delivery_tag: 2,
            multiple: true,
        })
        .unwrap();
    assert_eq!(
        h.sink.sent(),
        vec![
            Packet::PubAck { packet_id: 10 },
            Packet::PubAck { packet_id: 11 },
        ]
    );
    assert_eq!(h.processor.pending_confirm_count(), 1);
}

#[tokio::test]
async fn retained_publish_is_stored() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(publish_frame("a/b", QoS::AtMostOnce, None, true, b"keep"))
        .await
        .unwrap();
    let store = h.retainers.store("/");
    assert_eq!(store.ops(), vec![RetainOp::Retain("a/b".to_string())]);
    assert_eq!(
        store.retained("a/b").unwrap().payload,
        Bytes::from_static(b"keep")
    );
}

#[tokio::test]
async fn retained_publish_with_empty_payload_clears() {
    let mut h = connected(true).await;
    let store = h.retainers.store("/");
    store.preload(
        "a/b",
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"old"),
        },
    );

    h.processor
        .process_frame(publish_frame("a/b", QoS::AtMostOnce, None, true, b""))
        .await
        .unwrap();
    assert_eq!(store.ops(), vec![RetainOp::Clear("a/b".to_string())]);
    assert!(store.retained("a/b").is_none());
}

#[tokio::test]
async fn unauthorized_publish_is_fatal() {
    let mut h = connected(true).await;
    h.access.deny_write("a.b");
    let err = h
        .processor
        .process_frame(publish_frame("a/b", QoS::AtMostOnce, None, false, b"m"))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ProcessorErrorKind::Unauthorized { .. }));
    assert!(h.broker.ops().is_empty());
}

#[tokio::test]
async fn access_check_failure_is_coerced_to_refusal() {
    let mut h = connected(true).await;
    h.access.fail_with("backend unreachable");
    let err = h
        .processor
        .process_frame(publish_frame("a/b", QoS::AtMostOnce, None, false, b"m"))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ProcessorErrorKind::Unauthorized { .. }));
}

// ---------- Inbound deliveries ----------

#[tokio::test]
async fn qos0_delivery_emits_publish_without_packet_id() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtMostOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 0));
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(&tag, 1, "a.b", vec![], false))
        .unwrap();

    assert_eq!(
        h.sink.sent(),
        vec![Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"payload"),
        })]
    );
    // Receipt is acknowledged to flow control; no basic.ack (the consumer
    // is no-ack).
    assert_eq!(
        h.broker.ops(),
        vec![BrokerOp::NotifyReceived {
            channel: 1,
            delivery_tag: 1,
        }]
    );
    assert_eq!(h.processor.pending_puback_count(), 0);
}

#[tokio::test]
async fn qos1_delivery_tracks_packet_until_client_puback() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 1));
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(
            &tag,
            33,
            "a.b",
            vec![(HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(1))],
            false,
        ))
        .unwrap();

    let frames = h.sink.sent();
    let packet_id = match &frames[..] {
        [Packet::Publish(publish)] => {
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(!publish.dup);
            assert!(!publish.retain);
            assert_eq!(publish.topic, "a/b");
            publish.packet_id.unwrap()
        }
        other => panic!("unexpected frames: {other:?}"),
    };
    assert_eq!(h.processor.pending_puback_count(), 1);
    // No broker-side ack until the client PUBACKs.
    assert!(!h
        .broker
        .ops()
        .iter()
        .any(|op| matches!(op, BrokerOp::BasicAck { .. })));

    h.processor
        .process_frame(Packet::PubAck { packet_id })
        .await
        .unwrap();
    assert!(h.broker.ops().contains(&BrokerOp::BasicAck {
        channel: 1,
        delivery_tag: 33,
    }));
    assert_eq!(h.processor.pending_puback_count(), 0);
}

#[tokio::test]
async fn qos0_tagged_delivery_on_qos1_queue_acks_immediately() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 1));
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(
            &tag,
            44,
            "a.b",
            vec![(HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(0))],
            false,
        ))
        .unwrap();

    // Emitted at QoS 0 and settled with the broker right away: the client
    // will never PUBACK it.
    let frames = h.sink.sent();
    assert!(matches!(
        &frames[..],
        [Packet::Publish(publish)]
            if publish.qos == QoS::AtMostOnce && publish.packet_id.is_none()
    ));
    assert!(h.broker.ops().contains(&BrokerOp::BasicAck {
        channel: 1,
        delivery_tag: 44,
    }));
    assert_eq!(h.processor.pending_puback_count(), 0);
}

#[tokio::test]
async fn duplicate_qos0_delivery_on_qos1_queue_is_suppressed_and_acked() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 1));
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(
            &tag,
            55,
            "a.b",
            vec![(HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(0))],
            true,
        ))
        .unwrap();

    assert!(h.sink.sent().is_empty());
    assert!(h.broker.ops().contains(&BrokerOp::BasicAck {
        channel: 1,
        delivery_tag: 55,
    }));
}

#[tokio::test]
async fn duplicate_qos0_delivery_on_qos0_queue_is_dropped() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtMostOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 0));
    h.broker.clear_ops();
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(
            &tag,
            66,
            "a.b",
            vec![(HEADER_DUP.to_string(), FieldValue::Bool(true))],
            false,
        ))
        .unwrap();

    assert!(h.sink.sent().is_empty());
    // Nothing to ack on a no-ack consumer.
    assert_eq!(
        h.broker.ops(),
        vec![BrokerOp::NotifyReceived {
            channel: 1,
            delivery_tag: 66,
        }]
    );
}

#[tokio::test]
async fn redelivered_qos1_delivery_sets_dup_flag() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(subscribe_frame(1, &[("a/b", QoS::AtLeastOnce)]))
        .await
        .unwrap();
    let tag = consumer_tag_for(&h.broker, &queue_name(CLIENT_ID, 1));
    let _ = h.sink.take();

    h.processor
        .handle_amqp_event(delivery_event(&tag, 77, "a.b", vec![], true))
        .unwrap();

    let frames = h.sink.sent();
    assert!(matches!(
        &frames[..],
        [Packet::Publish(publish)] if publish.dup && publish.qos == QoS::AtLeastOnce
    ));
}

#[tokio::test]
async fn puback_for_unknown_packet_id_is_ignored() {
    let mut h = connected(true).await;
    h.processor
        .process_frame(Packet::PubAck { packet_id: 999 })
        .await
        .unwrap();
    assert!(h.broker.ops().is_empty());
    assert!(h.sink.sent().is_empty());
}

// ---------- PINGREQ / DISCONNECT ----------

#[tokio::test]
async fn pingreq_gets_pingresp_every_time() {
    let mut h = connected(true).await;
    h.processor.process_frame(Packet::PingReq).await.unwrap();
    h.processor.process_frame(Packet::PingReq).await.unwrap();
    assert_eq!(h.sink.sent(), vec![Packet::PingResp, Packet::PingResp]);
}

#[tokio::test]
async fn disconnect_stops_without_response() {
    let mut h = connected(true).await;
    let outcome = h.processor.process_frame(Packet::Disconnect).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Stop);
    assert!(h.sink.sent().is_empty());
}

// ---------- Will and teardown ----------

async fn connected_with_will(will: LastWill) -> Harness {
    let mut h = harness();
    h.processor
        .process_frame(Packet::Connect(Connect {
            proto_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: CLIENT_ID.to_string(),
            last_will: Some(will),
            username: None,
            password: None,
        }))
        .await
        .unwrap();
    h.broker.clear_ops();
    let _ = h.sink.take();
    h
}

#[tokio::test]
async fn send_will_publishes_and_closes_channels() {
    let mut h = connected_with_will(LastWill {
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "will/t".to_string(),
        payload: Bytes::from_static(b"gone"),
    })
    .await;

    h.processor.send_will().await;

    let channel = confirm_channel(&h.broker);
    let ops = h.broker.ops();
    assert!(ops.iter().any(|op| matches!(
        op,
        BrokerOp::BasicPublish { channel: c, publish }
            if *c == channel && publish.routing_key == "will.t" && publish.delivery_mode == 2
    )));
    // The will was retained.
    assert_eq!(
        h.retainers.store("/").ops(),
        vec![RetainOp::Retain("will/t".to_string())]
    );
    // Publish channel closes before the consume channel.
    let closes: Vec<usize> = ops
        .iter()
        .filter_map(|op| match op {
            BrokerOp::ChannelClosed { channel } => Some(*channel),
            _ => None,
        })
        .collect();
    assert_eq!(closes, vec![channel, 1]);
}

#[tokio::test]
async fn send_will_downgrades_qos2_will() {
    let mut h = connected_with_will(LastWill {
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "will/t".to_string(),
        payload: Bytes::from_static(b"gone"),
    })
    .await;

    h.processor.send_will().await;
    assert!(h.broker.ops().iter().any(|op| matches!(
        op,
        BrokerOp::BasicPublish { publish, .. }
            if publish.headers.contains(&(HEADER_PUBLISH_QOS.to_string(), FieldValue::Byte(1)))
    )));
}

#[tokio::test]
async fn send_will_skips_on_denied_write() {
    let mut h = connected_with_will(LastWill {
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "will/t".to_string(),
        payload: Bytes::from_static(b"gone"),
    })
    .await;
    h.access.deny_write("will.t");

    h.processor.send_will().await;

    let ops = h.broker.ops();
    assert!(!ops
        .iter()
        .any(|op| matches!(op, BrokerOp::BasicPublish { .. })));
    // Channels still close.
    assert!(ops.contains(&BrokerOp::ChannelClosed { channel: 1 }));
}

#[tokio::test]
async fn send_will_without_will_only_closes_channels() {
    let mut h = connected(true).await;
    h.processor.send_will().await;
    assert_eq!(
        h.broker.ops(),
        vec![BrokerOp::ChannelClosed { channel: 1 }]
    );
}

#[tokio::test]
async fn close_connection_unregisters_and_is_idempotent() {
    let mut h = connected(true).await;
    let client_id = h.processor.client_id().to_string();

    h.processor.close_connection().await;
    h.processor.close_connection().await;

    assert_eq!(
        h.registry.events(),
        vec![
            RegistryEvent::Registered(client_id.clone()),
            RegistryEvent::Unregistered(client_id),
        ]
    );
    let closes = h
        .broker
        .ops()
        .into_iter()
        .filter(|op| *op == BrokerOp::ConnectionClosed)
        .count();
    assert_eq!(closes, 1);
    assert!(!h.processor.is_connected());
}

// ---------- Introspection ----------

#[tokio::test]
async fn connection_info_snapshot() {
    let mut h = connected(true).await;
    let info = h.processor.info();
    assert_eq!(info.host, "127.0.0.1");
    assert_eq!(info.port, 1883);
    assert_eq!(info.peer_port, 52000);
    assert_eq!(info.protocol, ("MQTT".to_string(), "3.1.1".to_string()));
    assert!(!info.ssl);
    assert_eq!(info.channels, 1);
    assert_eq!(info.channel_max, 1);
    assert_eq!(info.frame_max, 0);
    assert_eq!(
        info.client_properties,
        vec![("client_id".to_string(), CLIENT_ID.to_string())]
    );

    // The confirm channel shows up once a QoS-1 publish opened it.
    h.processor
        .process_frame(publish_frame("a", QoS::AtLeastOnce, Some(1), false, b"m"))
        .await
        .unwrap();
    assert_eq!(h.processor.info().channels, 2);
}
