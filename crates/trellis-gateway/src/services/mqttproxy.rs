use std::sync::Arc;

use tracing::warn;
use trellis_bus::api::mqtt;
use trellis_object::{Fault, Map, Object, obj_map};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError,
    authz::{authorize, mqtt_matcher},
    dispatch::{Operation, OperationInfo, Service},
    json::{base64_decode, base64_encode},
    services::{qos_arg, qos_str_arg, require_bytes},
    subscriptions::bind_subscription,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.ipc.mqttproxy",
    operations: &[
        Operation {
            name: "aws.greengrass#PublishToIoTCore",
            handler: handle_publish_to_iot_core,
        },
        Operation {
            name: "aws.greengrass#SubscribeToIoTCore",
            handler: handle_subscribe_to_iot_core,
        },
    ],
};

fn handle_publish_to_iot_core(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let topic_name = require_bytes(args, b"topicName")?;
    let payload_b64 = args.get(b"payload").and_then(Object::as_bytes).unwrap_or_default();
    let qos = qos_arg(args)?;

    let payload = base64_decode(payload_b64).map_err(|_| {
        warn!("'payload' is not valid base64");
        IpcError::service("'payload' is not valid base64.")
    })?;

    authorize(info, topic_name, mqtt_matcher).map_err(|_| IpcError::unauthorized())?;

    mqtt::publish(topic_name, &payload, qos, true).map_err(|err| {
        warn!(%err, "failed to publish the message");
        IpcError::service("Failed to publish the message.")
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#PublishToIoTCoreResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}

fn iot_core_event(
    gateway: &Arc<Gateway>,
    data: &Object<'_>,
    resp_handle: Handle,
    stream_id: i32,
) -> Result<(), Fault> {
    let (topic, payload) = mqtt::parse_subscribe_response(data)?;
    let payload_b64 = base64_encode(payload);

    let response = obj_map! {
        b"message" => obj_map! {
            b"topicName" => Object::bytes(topic),
            b"payload" => Object::bytes(payload_b64.as_bytes()),
        },
    };

    if let Err(err) = gateway.response_send(
        resp_handle,
        stream_id,
        "aws.greengrass#IoTCoreMessage",
        &response,
    ) {
        warn!(%err, "failed to send subscription response; skipping");
    }
    Ok(())
}

fn handle_subscribe_to_iot_core(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let topic_name = require_bytes(args, b"topicName")?;
    let qos = qos_str_arg(args)?;

    authorize(info, topic_name, mqtt_matcher).map_err(|_| IpcError::unauthorized())?;

    let mut call_args = Map::new();
    call_args.insert(b"topic_filter".as_slice(), Object::bytes(topic_name));
    call_args.insert(b"qos".as_slice(), Object::I64(i64::from(qos)));

    bind_subscription(
        gateway,
        handle,
        stream_id,
        mqtt::INTERFACE,
        "subscribe",
        &call_args,
        iot_core_event,
    )
    .map_err(|err| {
        warn!(%err, "failed to bind the subscription");
        IpcError::service("Failed to bind the subscription.")
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#SubscribeToIoTCoreResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}
