use std::sync::Arc;

use tracing::warn;
use trellis_bus::api::config as cfg;
use trellis_object::Map;
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError, IpcErrorCode,
    dispatch::{Operation, OperationInfo, Service},
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.ipc.private",
    operations: &[Operation {
        name: "aws.greengrass.private#GetSystemConfig",
        handler: handle_get_system_config,
    }],
};

fn handle_get_system_config(
    gateway: &Arc<Gateway>,
    _info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let Some(key) = args.get(b"key").and_then(trellis_object::Object::as_bytes) else {
        warn!("received invalid parameters");
        return Err(IpcError::new(IpcErrorCode::InvalidArguments, "Received invalid parameters."));
    };

    let value = cfg::read(&[b"system", key]).map_err(|err| {
        warn!(%err, "failed to read the system configuration");
        IpcError::service("Failed to read the system configuration.")
    })?;

    // No service-model-type on this internal response.
    gateway
        .response_send(handle, stream_id, "", &value)
        .map_err(|_| IpcError::default())
}
