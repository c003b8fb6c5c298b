use std::sync::Arc;

use tracing::warn;
use trellis_bus::call;
use trellis_object::{Map, Object};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError,
    dispatch::{Operation, OperationInfo, Service},
    services::require_bytes,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.ipc.lifecycle",
    operations: &[Operation {
        name: "aws.greengrass#UpdateState",
        handler: handle_update_state,
    }],
};

fn handle_update_state(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let state = require_bytes(args, b"state")?;

    // No authorization: UpdateState only affects the caller itself.
    let mut call_args = Map::new();
    call_args.insert(b"component_name".as_slice(), Object::bytes(info.component.as_slice()));
    call_args.insert(b"lifecycle_state".as_slice(), Object::bytes(state));

    call("gg_health", "update_status", &call_args).map_err(|err| {
        warn!(%err, "failed to update the lifecycle state");
        IpcError::service("Failed to update the lifecycle state.")
    })?;

    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#UpdateStateResponse",
            &Object::Map(Map::new()),
        )
        .map_err(|_| IpcError::default())
}
