use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use trellis_bus::{BusServer, Method, SubscriptionClient, api::config as cfg, call};
use trellis_object::{Map, Object, obj_map};
use trellis_pool::Handle;
use trellis_wire::{
    Header, HeaderValue, MAX_FRAME_LEN, MessageFlags, MessageType, PRELUDE_LEN, decode_frame,
    decode_prelude, encode_frame,
};

fn wait_for(path: &Path, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{what} did not come up");
        thread::sleep(Duration::from_millis(5));
    }
}

fn start_interface(name: &'static str, methods: Vec<Method>) {
    let server = BusServer::new(methods);
    thread::spawn(move || server.listen(name).unwrap());
    wait_for(&trellis_bus::interface_socket_path(name).unwrap(), name);
}

/// Raw eventstream client against the gateway socket.
struct EsClient {
    stream: UnixStream,
}

#[derive(Debug, Default)]
struct RecvFrame {
    message_type: i32,
    flags: i32,
    stream_id: i32,
    model_type: Option<Vec<u8>>,
    svcuid: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl EsClient {
    fn connect(path: &Path) -> Self {
        Self { stream: UnixStream::connect(path).unwrap() }
    }

    fn send(&mut self, message_type: MessageType, flags: i32, stream_id: i32, extra: &[Header<'_>], payload: &[u8]) {
        let mut headers = vec![
            Header::new(b":message-type", HeaderValue::Int32(message_type as i32)),
            Header::new(b":message-flags", HeaderValue::Int32(flags)),
            Header::new(b":stream-id", HeaderValue::Int32(stream_id)),
        ];
        headers.extend_from_slice(extra);

        let mut buf = Vec::new();
        encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |out, _| {
            out.extend_from_slice(payload);
            Ok(())
        })
        .unwrap();
        self.stream.write_all(&buf).unwrap();
    }

    fn recv(&mut self) -> RecvFrame {
        let mut prelude_buf = [0u8; PRELUDE_LEN];
        self.stream.read_exact(&mut prelude_buf).unwrap();
        let prelude = decode_prelude(&prelude_buf).unwrap();

        let mut data = vec![0u8; prelude.data_len()];
        self.stream.read_exact(&mut data).unwrap();
        let msg = decode_frame(&prelude, &data).unwrap();

        let mut frame = RecvFrame { payload: msg.payload.to_vec(), ..RecvFrame::default() };
        for (name, value) in msg.headers() {
            match (name, value) {
                (b":message-type", HeaderValue::Int32(v)) => frame.message_type = v,
                (b":message-flags", HeaderValue::Int32(v)) => frame.flags = v,
                (b":stream-id", HeaderValue::Int32(v)) => frame.stream_id = v,
                (b"service-model-type", HeaderValue::String(s)) => {
                    frame.model_type = Some(s.to_vec());
                }
                (b"svcuid", HeaderValue::String(s)) => frame.svcuid = Some(s.to_vec()),
                _ => {}
            }
        }
        frame
    }

    fn recv_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0) | Err(_))
    }
}

struct WidgetPeerAuth;

impl trellis_gateway::PeerAuth for WidgetPeerAuth {
    fn allows(&self, pid: i32, component_name: &[u8]) -> bool {
        pid == std::process::id() as i32 && component_name == b"com.acme.Widget"
    }
}

fn json(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload).unwrap()
}

#[test]
fn gateway_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    // Safety: set before any thread reads it; only test in this binary.
    unsafe { std::env::set_var("TRELLIS_SOCKET_DIR", dir.path()) };

    SubscriptionClient::start();

    // Real configuration daemon.
    let store = Arc::new(trellis_configd::ConfigStore::default());
    start_interface(trellis_configd::INTERFACE, trellis_configd::methods(store));

    // Access-control policy for the widget component: publish to
    // widgets/* over mqtt, subscribe to anything over pubsub.
    cfg::write(
        &[
            b"services",
            b"com.acme.Widget",
            b"configuration",
            b"accessControl",
            b"aws.greengrass.ipc.mqttproxy",
            b"p1",
        ],
        obj_map! {
            b"operations" => Object::List(vec![Object::str("aws.greengrass#PublishToIoTCore")]),
            b"resources" => Object::List(vec![Object::str("widgets/*")]),
        },
        None,
    )
    .unwrap();
    cfg::write(
        &[
            b"services",
            b"com.acme.Widget",
            b"configuration",
            b"accessControl",
            b"aws.greengrass.ipc.pubsub",
            b"p1",
        ],
        obj_map! {
            b"operations" => Object::List(vec![Object::str("*")]),
            b"resources" => Object::List(vec![Object::str("*")]),
        },
        None,
    )
    .unwrap();

    // Fake MQTT proxy daemon recording publishes.
    let (publish_tx, publish_rx) = mpsc::channel::<(Vec<u8>, Vec<u8>, i64, bool)>();
    start_interface(
        "aws_iot_mqtt",
        vec![Method::unary("publish", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            publish_tx
                .send((
                    params.get(b"topic").and_then(Object::as_bytes).unwrap().to_vec(),
                    params.get(b"payload").and_then(Object::as_bytes).unwrap().to_vec(),
                    params.get(b"qos").and_then(Object::as_i64).unwrap(),
                    params.get(b"retain").and_then(Object::as_bool).unwrap(),
                ))
                .unwrap();
            server.respond(handle, &Object::Null);
            Ok(())
        })],
    );

    // Fake pubsub daemon: accepts subscriptions; `emit` pushes one
    // event to the last subscriber so the test controls interleaving.
    let subscriber: Arc<Mutex<Option<Handle>>> = Arc::default();
    let (pubsub_closed_tx, pubsub_closed_rx) = mpsc::channel::<()>();
    let accept_slot = Arc::clone(&subscriber);
    let emit_slot = Arc::clone(&subscriber);
    start_interface(
        "gg_pubsub",
        vec![
            Method::subscription("subscribe", move |server: &BusServer, _params: &Map<'_>, handle: Handle| {
                *accept_slot.lock().unwrap() = Some(handle);
                let closed = pubsub_closed_tx.clone();
                server.sub_accept(handle, Some(Box::new(move |_| closed.send(()).unwrap())));
                Ok(())
            }),
            Method::unary("emit", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
                let target = emit_slot.lock().unwrap().unwrap();
                let seq = params.get(b"seq").and_then(Object::as_i64).unwrap();
                let event = obj_map! {
                    b"topic" => Object::str("my/topic"),
                    b"type" => Object::str("base64"),
                    b"message" => Object::bytes(format!("event-{seq}").into_bytes()),
                };
                server.sub_respond(target, &event);
                server.respond(handle, &Object::Null);
                Ok(())
            }),
        ],
    );

    // Component registry, its verify interface, and the gateway itself.
    let registry = Arc::new(trellis_gateway::ComponentRegistry::new());
    trellis_gateway::serve_verify_interface(Arc::clone(&registry)).unwrap();
    wait_for(&trellis_bus::interface_socket_path("ipc_component").unwrap(), "ipc_component");

    let gateway = trellis_gateway::Gateway::new(registry, Box::new(WidgetPeerAuth));
    let gateway_socket = dir.path().join("gg-ipc.socket");
    {
        let gateway = Arc::clone(&gateway);
        let socket = gateway_socket.clone();
        thread::spawn(move || gateway.listen(&socket).unwrap());
    }
    wait_for(&gateway_socket, "gateway");

    // Scenario: connect with peer credentials. A ping is answered even
    // before the handshake.
    let mut client = EsClient::connect(&gateway_socket);
    client.send(MessageType::Ping, 0, 0, &[], br#"{"probe":1}"#);
    let pong = client.recv();
    assert_eq!(pong.message_type, MessageType::PingResponse as i32);
    assert_eq!(pong.payload, br#"{"probe":1}"#);

    client.send(
        MessageType::Connect,
        0,
        0,
        &[Header::new(b":version", HeaderValue::String(b"0.1.0"))],
        br#"{"componentName":"com.acme.Widget"}"#,
    );
    let ack = client.recv();
    assert_eq!(ack.message_type, MessageType::ConnectAck as i32);
    assert_ne!(ack.flags & MessageFlags::CONNECTION_ACCEPTED.bits(), 0);
    let svcuid = ack.svcuid.expect("peer-auth ack carries svcuid");
    assert_eq!(svcuid.len(), 16);

    // The issued token verifies over the ipc_component interface; a
    // made-up one does not.
    let mut params = Map::new();
    params.insert(b"svcuid".as_slice(), Object::bytes(svcuid.as_slice()));
    assert_eq!(call("ipc_component", "verify_svcuid", &params).unwrap(), Object::Bool(true));
    let mut params = Map::new();
    params.insert(b"svcuid".as_slice(), Object::str("AAAAAAAAAAAAAAAA"));
    let verified = call("ipc_component", "verify_svcuid", &params).unwrap();
    assert_eq!(verified, Object::Bool(false));

    // Scenario: authorized publish translates onto the bus.
    client.send(
        MessageType::ApplicationMessage,
        0,
        1,
        &[Header::new(b"operation", HeaderValue::String(b"aws.greengrass#PublishToIoTCore"))],
        br#"{"topicName":"widgets/1","payload":"aGVsbG8=","qos":"0"}"#,
    );
    let response = client.recv();
    assert_eq!(response.message_type, MessageType::ApplicationMessage as i32);
    assert_eq!(response.stream_id, 1);
    assert_eq!(
        response.model_type.as_deref(),
        Some(b"aws.greengrass#PublishToIoTCoreResponse".as_slice())
    );
    assert_eq!(json(&response.payload), serde_json::json!({}));

    let (topic, payload, qos, retain) =
        publish_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(topic, b"widgets/1");
    assert_eq!(payload, b"hello");
    assert_eq!(qos, 0);
    assert!(retain);

    // Scenario: publish outside the policy is denied on the stream.
    client.send(
        MessageType::ApplicationMessage,
        0,
        2,
        &[Header::new(b"operation", HeaderValue::String(b"aws.greengrass#PublishToIoTCore"))],
        br#"{"topicName":"other/1","payload":"aGVsbG8=","qos":"0"}"#,
    );
    let denied = client.recv();
    assert_eq!(denied.message_type, MessageType::ApplicationError as i32);
    assert_eq!(denied.stream_id, 2);
    assert_ne!(denied.flags & MessageFlags::TERMINATE_STREAM.bits(), 0);
    assert_eq!(
        denied.model_type.as_deref(),
        Some(b"aws.greengrass#UnauthorizedError".as_slice())
    );
    assert_eq!(
        json(&denied.payload),
        serde_json::json!({
            "_message": "IPC Operation not authorized.",
            "_errorCode": "UnauthorizedError"
        })
    );

    // SubscribeToIoTCore only takes qos as a string; an integer fails
    // validation before authorization is consulted.
    client.send(
        MessageType::ApplicationMessage,
        0,
        4,
        &[Header::new(b"operation", HeaderValue::String(b"aws.greengrass#SubscribeToIoTCore"))],
        br#"{"topicName":"widgets/1","qos":1}"#,
    );
    let bad_qos = client.recv();
    assert_eq!(bad_qos.message_type, MessageType::ApplicationError as i32);
    assert_eq!(bad_qos.stream_id, 4);
    assert_eq!(
        bad_qos.model_type.as_deref(),
        Some(b"aws.greengrass#ServiceError".as_slice())
    );
    assert_eq!(
        json(&bad_qos.payload),
        serde_json::json!({
            "_message": "Received invalid parameters.",
            "_errorCode": "ServiceError"
        })
    );

    // Scenario: subscribe, three events, client terminates the stream.
    client.send(
        MessageType::ApplicationMessage,
        0,
        3,
        &[Header::new(b"operation", HeaderValue::String(b"aws.greengrass#SubscribeToTopic"))],
        br#"{"topic":"my/topic"}"#,
    );
    let sub_response = client.recv();
    assert_eq!(
        sub_response.model_type.as_deref(),
        Some(b"aws.greengrass#SubscribeToTopicResponse".as_slice())
    );

    for seq in 0..3 {
        let mut params = Map::new();
        params.insert(b"seq".as_slice(), Object::I64(seq));
        call("gg_pubsub", "emit", &params).unwrap();

        let event = client.recv();
        assert_eq!(event.stream_id, 3);
        assert_eq!(
            event.model_type.as_deref(),
            Some(b"aws.greengrass#SubscriptionResponseMessage".as_slice())
        );
        let body = json(&event.payload);
        assert_eq!(body["binaryMessage"]["context"]["topic"], "my/topic");
        assert_eq!(
            body["binaryMessage"]["message"],
            serde_json::Value::String(format!("event-{seq}"))
        );
    }

    client.send(MessageType::ApplicationMessage, MessageFlags::TERMINATE_STREAM.bits(), 3, &[], b"{}");
    pubsub_closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Scenario: a token connect authenticates the same component.
    let mut token_client = EsClient::connect(&gateway_socket);
    let connect_payload = format!(
        r#"{{"authToken":"{}","componentName":"com.acme.Widget"}}"#,
        String::from_utf8(svcuid.clone()).unwrap()
    );
    token_client.send(
        MessageType::Connect,
        0,
        0,
        &[Header::new(b":version", HeaderValue::String(b"0.1.0"))],
        connect_payload.as_bytes(),
    );
    let token_ack = token_client.recv();
    assert_ne!(token_ack.flags & MessageFlags::CONNECTION_ACCEPTED.bits(), 0);
    assert!(token_ack.svcuid.is_none());

    // Scenario: an unauthorized peer name is refused and disconnected.
    let mut evil = EsClient::connect(&gateway_socket);
    evil.send(
        MessageType::Connect,
        0,
        0,
        &[Header::new(b":version", HeaderValue::String(b"0.1.0"))],
        br#"{"componentName":"com.evil.Widget"}"#,
    );
    let refused = evil.recv();
    assert_eq!(refused.message_type, MessageType::ConnectAck as i32);
    assert_eq!(refused.flags & MessageFlags::CONNECTION_ACCEPTED.bits(), 0);
    assert!(evil.recv_eof());

    // Scenario: closing a connection releases its bus subscriptions.
    let mut sub_client = EsClient::connect(&gateway_socket);
    sub_client.send(
        MessageType::Connect,
        0,
        0,
        &[Header::new(b":version", HeaderValue::String(b"0.1.0"))],
        br#"{"componentName":"com.acme.Widget"}"#,
    );
    sub_client.recv();
    sub_client.send(
        MessageType::ApplicationMessage,
        0,
        1,
        &[Header::new(b"operation", HeaderValue::String(b"aws.greengrass#SubscribeToTopic"))],
        br#"{"topic":"my/topic"}"#,
    );
    sub_client.recv();
    drop(sub_client);
    pubsub_closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}
