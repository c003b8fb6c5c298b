//! One module per IPC service. Handlers share a common shape: validate
//! arguments, authorize the resource, translate onto the bus, send the
//! modeled response.

pub(crate) mod authagent;
pub(crate) mod cli;
pub(crate) mod config;
pub(crate) mod lifecycle;
pub(crate) mod mqttproxy;
pub(crate) mod private;
pub(crate) mod pubsub;

use tracing::warn;
use trellis_object::{Map, Object};

use crate::IpcError;

pub(crate) fn invalid_params() -> IpcError {
    warn!("received invalid parameters");
    IpcError::invalid_params()
}

pub(crate) fn require_bytes<'m>(args: &'m Map<'_>, key: &[u8]) -> Result<&'m [u8], IpcError> {
    args.get(key).and_then(Object::as_bytes).ok_or_else(invalid_params)
}

pub(crate) fn optional_bytes<'m>(
    args: &'m Map<'_>,
    key: &[u8],
) -> Result<Option<&'m [u8]>, IpcError> {
    match args.get(key) {
        None => Ok(None),
        Some(value) => value.as_bytes().map(Some).ok_or_else(invalid_params),
    }
}

pub(crate) fn require_map<'m>(args: &'m Map<'_>, key: &[u8]) -> Result<&'m Map<'m>, IpcError> {
    args.get(key).and_then(Object::as_map).ok_or_else(invalid_params)
}

/// `keyPath` style arguments: an optional list of strings, defaulting
/// to empty.
pub(crate) fn optional_str_list<'m>(
    args: &'m Map<'_>,
    key: &[u8],
) -> Result<Vec<&'m [u8]>, IpcError> {
    let Some(value) = args.get(key) else {
        return Ok(Vec::new());
    };
    let items = value.as_list().ok_or_else(invalid_params)?;
    items
        .iter()
        .map(|item| item.as_bytes().ok_or_else(invalid_params))
        .collect()
}

fn parse_qos_str(text: &[u8]) -> Result<i64, IpcError> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            warn!("failed to parse 'qos' string value");
            IpcError::service("Failed to parse 'qos' string value.")
        })
}

fn check_qos_range(qos: i64) -> Result<u8, IpcError> {
    if !(0..=2).contains(&qos) {
        warn!(qos, "'qos' not a valid value");
        return Err(IpcError::service("'qos' not a valid value."));
    }
    Ok(qos as u8)
}

/// `PublishToIoTCore` takes `qos` as a string or an integer; either
/// way it must be a valid MQTT QoS level.
pub(crate) fn qos_arg(args: &Map<'_>) -> Result<u8, IpcError> {
    let qos = match args.get(b"qos") {
        None => 0,
        Some(Object::I64(qos)) => *qos,
        Some(Object::Bytes(text)) => parse_qos_str(text)?,
        Some(_) => {
            warn!("key qos of invalid type");
            return Err(IpcError::service("Key qos of invalid type."));
        }
    };
    check_qos_range(qos)
}

/// `SubscribeToIoTCore` only models `qos` as a string; anything else
/// fails argument validation outright.
pub(crate) fn qos_str_arg(args: &Map<'_>) -> Result<u8, IpcError> {
    let qos = match args.get(b"qos") {
        None => 0,
        Some(Object::Bytes(text)) => parse_qos_str(text)?,
        Some(_) => return Err(invalid_params()),
    };
    check_qos_range(qos)
}
