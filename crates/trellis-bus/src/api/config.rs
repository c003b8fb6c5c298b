//! Client surface of the `gg_config` configuration store interface.

use tracing::warn;
use trellis_object::{Fault, Map, Object};
use trellis_pool::Handle;

use crate::{CallError, SubCloseFn, SubResponseFn, SubscriptionClient, call, notify};

pub const INTERFACE: &str = "gg_config";

/// Configuration key paths are depth-bounded.
pub const MAX_KEY_PATH_DEPTH: usize = 16;

fn key_path_object<'a>(key_path: &[&'a [u8]]) -> Result<Object<'a>, Fault> {
    if key_path.len() > MAX_KEY_PATH_DEPTH {
        warn!(depth = key_path.len(), "config key path too deep");
        return Err(Fault::Range);
    }
    Ok(Object::List(key_path.iter().map(|segment| Object::bytes(*segment)).collect()))
}

fn key_path_params<'a>(key_path: &[&'a [u8]]) -> Result<Map<'a>, Fault> {
    let mut params = Map::new();
    params.insert(b"key_path".as_slice(), key_path_object(key_path)?);
    Ok(params)
}

/// Reads the value at `key_path`.
pub fn read(key_path: &[&[u8]]) -> Result<Object<'static>, CallError> {
    call(INTERFACE, "read", &key_path_params(key_path)?)
}

/// Reads a value that must be a byte string.
pub fn read_str(key_path: &[&[u8]]) -> Result<Vec<u8>, CallError> {
    let value = read(key_path)?;
    match value {
        Object::Bytes(bytes) => Ok(bytes.into_owned()),
        _ => {
            warn!("config value is not a string");
            Err(CallError::Local(Fault::Config))
        }
    }
}

/// Merges `value` at `key_path`. Without a timestamp the store stamps
/// the write with its current time.
pub fn write(
    key_path: &[&[u8]],
    value: Object<'_>,
    timestamp: Option<i64>,
) -> Result<(), CallError> {
    let mut params = key_path_params(key_path)?;
    params.insert(b"value".as_slice(), value);
    if let Some(timestamp) = timestamp {
        params.insert(b"timestamp".as_slice(), Object::I64(timestamp));
    }
    call(INTERFACE, "write", &params).map(drop)
}

/// Fire-and-forget variant of [`write`].
pub fn write_notify(
    key_path: &[&[u8]],
    value: Object<'_>,
    timestamp: Option<i64>,
) -> Result<(), Fault> {
    let mut params = key_path_params(key_path)?;
    params.insert(b"value".as_slice(), value);
    if let Some(timestamp) = timestamp {
        params.insert(b"timestamp".as_slice(), Object::I64(timestamp));
    }
    notify(INTERFACE, "write", &params)
}

/// Lists the direct child keys under `key_path`.
pub fn list(key_path: &[&[u8]]) -> Result<Vec<Vec<u8>>, CallError> {
    let value = call(INTERFACE, "list", &key_path_params(key_path)?)?;
    let Some(items) = value.as_list() else {
        warn!("config list response is not a list");
        return Err(CallError::Local(Fault::Config));
    };
    items
        .iter()
        .map(|item| {
            item.as_bytes().map(<[u8]>::to_vec).ok_or_else(|| {
                warn!("config list entry is not a string");
                CallError::Local(Fault::Config)
            })
        })
        .collect()
}

/// Deletes the subtree rooted at `key_path`.
pub fn delete(key_path: &[&[u8]]) -> Result<(), CallError> {
    call(INTERFACE, "delete", &key_path_params(key_path)?).map(drop)
}

/// Subscribes to writes at or below `key_path`. Each event carries the
/// written key path as a list of byte strings.
pub fn subscribe(
    key_path: &[&[u8]],
    on_response: SubResponseFn,
    on_close: Option<SubCloseFn>,
) -> Result<Handle, CallError> {
    SubscriptionClient::get()?.subscribe(
        INTERFACE,
        "subscribe",
        &key_path_params(key_path)?,
        on_response,
        on_close,
    )
}
