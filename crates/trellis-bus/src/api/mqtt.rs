//! Client surface of the `aws_iot_mqtt` proxy interface served by
//! iotcored.

use tracing::warn;
use trellis_object::{Fault, Map, Object};
use trellis_pool::Handle;

use crate::{CallError, SubCloseFn, SubResponseFn, SubscriptionClient, call};

pub const INTERFACE: &str = "aws_iot_mqtt";

/// Publishes one MQTT message through the proxy.
pub fn publish(topic: &[u8], payload: &[u8], qos: u8, retain: bool) -> Result<(), CallError> {
    let mut params = Map::new();
    params.insert(b"topic".as_slice(), Object::bytes(topic));
    params.insert(b"payload".as_slice(), Object::bytes(payload));
    params.insert(b"qos".as_slice(), Object::I64(i64::from(qos)));
    params.insert(b"retain".as_slice(), Object::Bool(retain));
    call(INTERFACE, "publish", &params).map(drop)
}

/// Subscribes to an MQTT topic filter; events arrive as
/// `{topic, payload}` maps parseable with [`parse_subscribe_response`].
pub fn subscribe(
    topic_filter: &[u8],
    qos: u8,
    on_response: SubResponseFn,
    on_close: Option<SubCloseFn>,
) -> Result<Handle, CallError> {
    let mut params = Map::new();
    params.insert(b"topic_filter".as_slice(), Object::bytes(topic_filter));
    params.insert(b"qos".as_slice(), Object::I64(i64::from(qos)));
    SubscriptionClient::get()?.subscribe(INTERFACE, "subscribe", &params, on_response, on_close)
}

/// Splits a subscription event into `(topic, payload)`.
pub fn parse_subscribe_response<'a>(data: &'a Object<'_>) -> Result<(&'a [u8], &'a [u8]), Fault> {
    let Some(map) = data.as_map() else {
        warn!("mqtt subscription response is not a map");
        return Err(Fault::Failure);
    };
    let topic = map.get(b"topic").and_then(Object::as_bytes);
    let payload = map.get(b"payload").and_then(Object::as_bytes);
    match (topic, payload) {
        (Some(topic), Some(payload)) => Ok((topic, payload)),
        _ => {
            warn!("mqtt subscription response missing topic or payload");
            Err(Fault::Failure)
        }
    }
}
