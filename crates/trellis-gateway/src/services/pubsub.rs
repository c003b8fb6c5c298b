use std::sync::Arc;

use tracing::warn;
use trellis_bus::call;
use trellis_object::{Fault, Map, Object, obj_map};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError,
    authz::{authorize, default_matcher},
    dispatch::{Operation, OperationInfo, Service},
    services::{invalid_params, require_bytes, require_map},
    subscriptions::bind_subscription,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.ipc.pubsub",
    operations: &[
        Operation {
            name: "aws.greengrass#PublishToTopic",
            handler: handle_publish_to_topic,
        },
        Operation {
            name: "aws.greengrass#SubscribeToTopic",
            handler: handle_subscribe_to_topic,
        },
    ],
};

fn handle_publish_to_topic(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let topic = require_bytes(args, b"topic")?;
    let publish_message = require_map(args, b"publishMessage")?;

    let json_message = publish_message.get(b"jsonMessage");
    let binary_message = publish_message.get(b"binaryMessage");
    if json_message.is_some() == binary_message.is_some() {
        warn!("'publishMessage' must have exactly one of 'binaryMessage' or 'jsonMessage'");
        return Err(invalid_params());
    }

    let is_json = json_message.is_some();
    let inner = json_message.or(binary_message).and_then(Object::as_map).ok_or_else(invalid_params)?;
    let message = inner.get(b"message").ok_or_else(invalid_params)?;
    if !is_json && message.as_bytes().is_none() {
        return Err(invalid_params());
    }

    authorize(info, topic, default_matcher).map_err(|_| IpcError::unauthorized())?;

    let mut call_args = Map::new();
    call_args.insert(b"topic".as_slice(), Object::bytes(topic));
    call_args.insert(
        b"type".as_slice(),
        Object::str(if is_json { "json" } else { "base64" }),
    );
    call_args.insert(b"message".as_slice(), message.clone());

    call("gg_pubsub", "publish", &call_args).map_err(|err| {
        warn!(%err, "failed to publish the message");
        IpcError::service("Failed to publish the message.")
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#PublishToTopicResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}

fn topic_event(
    gateway: &Arc<Gateway>,
    data: &Object<'_>,
    resp_handle: Handle,
    stream_id: i32,
) -> Result<(), Fault> {
    let Some(event) = data.as_map() else {
        warn!("subscription response not a map");
        return Err(Fault::Failure);
    };
    let (Some(topic), Some(kind), Some(message)) = (
        event.get(b"topic").and_then(Object::as_bytes),
        event.get(b"type").and_then(Object::as_bytes),
        event.get(b"message"),
    ) else {
        warn!("received invalid subscription response");
        return Err(Fault::Failure);
    };

    let is_json = match kind {
        b"json" => true,
        b"base64" => {
            if message.as_bytes().is_none() {
                warn!("received invalid message type");
                return Err(Fault::Invalid);
            }
            false
        }
        _ => {
            warn!("received unknown subscription response type");
            return Err(Fault::Invalid);
        }
    };

    let inner = obj_map! {
        b"message" => message.clone(),
        b"context" => obj_map! { b"topic" => Object::bytes(topic) },
    };
    let key: &[u8] = if is_json { b"jsonMessage" } else { b"binaryMessage" };
    let mut response = Map::new();
    response.insert(key, inner);
    let response = Object::Map(response);

    if let Err(err) = gateway.response_send(
        resp_handle,
        stream_id,
        "aws.greengrass#SubscriptionResponseMessage",
        &response,
    ) {
        warn!(%err, "failed to send subscription response; skipping");
    }
    Ok(())
}

fn handle_subscribe_to_topic(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let topic = require_bytes(args, b"topic")?;

    authorize(info, topic, default_matcher).map_err(|_| IpcError::unauthorized())?;

    let mut call_args = Map::new();
    call_args.insert(b"topic_filter".as_slice(), Object::bytes(topic));

    bind_subscription(
        gateway,
        handle,
        stream_id,
        "gg_pubsub",
        "subscribe",
        &call_args,
        topic_event,
    )
    .map_err(|err| {
        warn!(%err, "failed to bind subscription");
        IpcError::service("Failed to bind subscription.")
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#SubscribeToTopicResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}
