use std::sync::Arc;

use tracing::{debug, warn};
use trellis_bus::{CallError, api::config as cfg, api::config::MAX_KEY_PATH_DEPTH};
use trellis_object::{Fault, Map, Object, obj_map};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError, IpcErrorCode,
    dispatch::{Operation, OperationInfo, Service},
    services::{optional_bytes, optional_str_list},
    subscriptions::bind_subscription,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.ipc.config",
    operations: &[
        Operation {
            name: "aws.greengrass#GetConfiguration",
            handler: handle_get_configuration,
        },
        Operation {
            name: "aws.greengrass#UpdateConfiguration",
            handler: handle_update_configuration,
        },
        Operation {
            name: "aws.greengrass#SubscribeToConfigurationUpdate",
            handler: handle_subscribe_to_configuration_update,
        },
    ],
};

/// Component-scoped key paths rewrite to
/// `["services", <component>, "configuration", ..keys]`.
fn full_key_path(component: &[u8], key_path: &[&[u8]]) -> Result<Vec<Vec<u8>>, IpcError> {
    if key_path.len() + 3 > MAX_KEY_PATH_DEPTH {
        warn!("config path depth larger than supported");
        return Err(IpcError::service("Config path depth larger than supported."));
    }
    let mut full = Vec::with_capacity(key_path.len() + 3);
    full.push(b"services".to_vec());
    full.push(component.to_vec());
    full.push(b"configuration".to_vec());
    full.extend(key_path.iter().map(|segment| segment.to_vec()));
    Ok(full)
}

fn as_refs(path: &[Vec<u8>]) -> Vec<&[u8]> {
    path.iter().map(Vec::as_slice).collect()
}

fn handle_get_configuration(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let key_path = optional_str_list(args, b"keyPath")?;
    let component_name = optional_bytes(args, b"componentName")?.unwrap_or(&info.component);

    let full_path = full_key_path(component_name, &key_path)?;
    let value = cfg::read(&as_refs(&full_path)).map_err(|err| {
        if err.remote() == Some(Fault::NoEntry) {
            IpcError::new(IpcErrorCode::ResourceNotFound, "Key not found.")
        } else {
            warn!(%err, "failed to read configuration");
            IpcError::default()
        }
    })?;

    let response = obj_map! {
        b"componentName" => Object::bytes(component_name),
        b"value" => value,
    };
    gateway
        .response_send(handle, stream_id, "aws.greengrass#GetConfigurationResponse", &response)
        .map_err(|_| IpcError::default())
}

fn rejects_access_control(key_path: &[&[u8]], value: &Object<'_>) -> bool {
    if key_path.first() == Some(&b"accessControl".as_slice()) {
        return true;
    }
    if key_path.is_empty() {
        if let Some(map) = value.as_map() {
            return map.iter().any(|(key, _)| key.as_ref() == b"accessControl");
        }
    }
    false
}

fn handle_update_configuration(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let invalid =
        || IpcError::new(IpcErrorCode::InvalidArguments, "Received invalid parameters.");

    let key_path = optional_str_list(args, b"keyPath").map_err(|_| invalid())?;
    let Some(value_to_merge) = args.get(b"valueToMerge") else {
        warn!("update missing valueToMerge");
        return Err(invalid());
    };
    let Some(timestamp) = args.get(b"timestamp").and_then(Object::as_f64) else {
        warn!("update missing timestamp");
        return Err(invalid());
    };

    if rejects_access_control(&key_path, value_to_merge) {
        warn!("cannot change component accessControl over IPC");
        return Err(IpcError::new(
            IpcErrorCode::InvalidArguments,
            "Config update is not allowed for following field [accessControl]",
        ));
    }

    // Seconds as float to milliseconds as integer; sub-millisecond
    // precision is dropped.
    let timestamp_ms = (timestamp * 1000.0) as i64;
    debug!(timestamp_ms, "updating configuration");

    let full_path = full_key_path(&info.component, &key_path)?;
    cfg::write(&as_refs(&full_path), value_to_merge.clone(), Some(timestamp_ms)).map_err(
        |err| {
            warn!(%err, "failed to update the configuration");
            IpcError::service("Failed to update the configuration.")
        },
    )?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#UpdateConfigurationResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}

/// Splits a store notification path back into component name and
/// component-relative key path.
fn parse_config_path<'a>(path: &'a [Object<'_>]) -> Result<(&'a [u8], Vec<&'a [u8]>), Fault> {
    let segments: Option<Vec<&[u8]>> = path.iter().map(Object::as_bytes).collect();
    let Some(segments) = segments else {
        return Err(Fault::Failure);
    };
    match segments.as_slice() {
        [services, component, configuration, rest @ ..]
            if *services == b"services" && *configuration == b"configuration" =>
        {
            Ok((component, rest.to_vec()))
        }
        _ => {
            warn!("notification key path has unexpected shape");
            Err(Fault::Failure)
        }
    }
}

fn configuration_update_event(
    gateway: &Arc<Gateway>,
    data: &Object<'_>,
    resp_handle: Handle,
    stream_id: i32,
) -> Result<(), Fault> {
    let Some(path) = data.as_list() else {
        warn!("received invalid subscription response, expected a list");
        return Err(Fault::Failure);
    };
    let (component_name, key_path) = parse_config_path(path)?;

    let response = obj_map! {
        b"configurationUpdateEvent" => obj_map! {
            b"componentName" => Object::bytes(component_name),
            b"keyPath" => Object::List(key_path.iter().map(|s| Object::bytes(*s)).collect()),
        },
    };

    if let Err(err) = gateway.response_send(
        resp_handle,
        stream_id,
        "aws.greengrass#ConfigurationUpdateEvents",
        &response,
    ) {
        warn!(%err, "failed to send subscription response; skipping");
    }
    Ok(())
}

fn handle_subscribe_to_configuration_update(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    // No key path (or an empty one) subscribes to every key under the
    // component's configuration.
    let key_path = optional_str_list(args, b"keyPath")?;
    let component_name = optional_bytes(args, b"componentName")?.unwrap_or(&info.component);

    let full_path = full_key_path(component_name, &key_path)?;
    let path_refs = as_refs(&full_path);

    let mut call_args = Map::new();
    call_args.insert(
        b"key_path".as_slice(),
        Object::List(path_refs.iter().map(|s| Object::bytes(*s)).collect()),
    );

    bind_subscription(
        gateway,
        handle,
        stream_id,
        cfg::INTERFACE,
        "subscribe",
        &call_args,
        configuration_update_event,
    )
    .map_err(|err| {
        if let CallError::Remote(Fault::NoEntry) = err {
            IpcError::new(IpcErrorCode::ResourceNotFound, "Key not found")
        } else {
            warn!(%err, "failed to subscribe to configuration update");
            IpcError::service("Failed to subscribe to configuration update.")
        }
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#SubscribeToConfigurationUpdateResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}
