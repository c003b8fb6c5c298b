use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};
use trellis_bus::{BusServer, Method, api::config::MAX_KEY_PATH_DEPTH};
use trellis_object::{Fault, Map, Object};
use trellis_pool::Handle;

use crate::ConfigStore;

pub const INTERFACE: &str = trellis_bus::api::config::INTERFACE;

fn key_path_arg(params: &Map<'_>) -> Result<Vec<Vec<u8>>, Fault> {
    let Some(list) = params.get(b"key_path").and_then(Object::as_list) else {
        warn!("request has invalid key_path argument");
        return Err(Fault::Invalid);
    };
    if list.len() > MAX_KEY_PATH_DEPTH {
        warn!(depth = list.len(), "key_path too deep");
        return Err(Fault::Range);
    }
    list.iter()
        .map(|segment| {
            segment.as_bytes().map(<[u8]>::to_vec).ok_or_else(|| {
                warn!("key_path elements must be strings");
                Fault::Range
            })
        })
        .collect()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

/// The `gg_config` method table, bound to `store`.
pub fn methods(store: Arc<ConfigStore>) -> Vec<Method> {
    let read_store = Arc::clone(&store);
    let list_store = Arc::clone(&store);
    let write_store = Arc::clone(&store);
    let delete_store = Arc::clone(&store);
    let subscribe_store = store;

    vec![
        Method::unary("read", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            let key_path = key_path_arg(params)?;
            let value = read_store.read(&key_path)?;
            server.respond(handle, &value);
            Ok(())
        }),
        Method::unary("list", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            let key_path = key_path_arg(params)?;
            let subkeys = list_store.list(&key_path)?;
            let response =
                Object::List(subkeys.into_iter().map(|key| Object::Bytes(key.into())).collect());
            server.respond(handle, &response);
            Ok(())
        }),
        Method::unary("write", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            let key_path = key_path_arg(params)?;
            let Some(value) = params.get(b"value") else {
                warn!("write request missing value");
                return Err(Fault::Invalid);
            };
            let timestamp = match params.get(b"timestamp") {
                None => now_millis(),
                Some(obj) => obj.as_i64().ok_or_else(|| {
                    warn!("write timestamp must be an integer");
                    Fault::Invalid
                })?,
            };

            debug!(timestamp, "merging config value");
            let notifications = write_store.write(&key_path, value, timestamp)?;
            for (subscriber, written_path) in notifications {
                let event = Object::List(
                    written_path.into_iter().map(|key| Object::Bytes(key.into())).collect(),
                );
                server.sub_respond(subscriber, &event);
            }

            server.respond(handle, &Object::Null);
            Ok(())
        }),
        Method::unary("delete", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            let key_path = key_path_arg(params)?;
            delete_store.delete(&key_path)?;
            server.respond(handle, &Object::Null);
            Ok(())
        }),
        Method::subscription("subscribe", move |server: &BusServer, params: &Map<'_>, handle: Handle| {
            let key_path = key_path_arg(params)?;
            subscribe_store.subscribe(&key_path, handle)?;
            let store = Arc::clone(&subscribe_store);
            server.sub_accept(handle, Some(Box::new(move |closed| store.drop_subscriber(closed))));
            Ok(())
        }),
    ]
}
