use std::sync::Arc;

use tracing::warn;
use trellis_object::{Map, Object, obj_map};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError, IpcErrorCode, Svcuid,
    dispatch::{Operation, OperationInfo, Service},
    services::require_bytes,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.authorizationagent",
    operations: &[Operation {
        name: "aws.greengrass#ValidateAuthorizationToken",
        handler: handle_validate_token,
    }],
};

/// Only the stream manager may validate tokens.
const STREAM_MANAGER: &[u8] = b"aws.greengrass.StreamManager";

fn handle_validate_token(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    if info.component != STREAM_MANAGER {
        warn!(
            component = %String::from_utf8_lossy(&info.component),
            "component does not have access to token verification"
        );
        return Err(IpcError::new(
            IpcErrorCode::Unauthorized,
            "Component does not have access to token verification IPC command.",
        ));
    }

    let token = require_bytes(args, b"token")?;
    let invalid_token = || {
        IpcError::new(
            IpcErrorCode::InvalidToken,
            "Invalid token used by stream manager when trying to authorize.",
        )
    };

    // An unknown token is an error, not `isValid: false`; callers
    // expect the Classic behavior.
    let svcuid = Svcuid::from_str_form(token).map_err(|_| invalid_token())?;
    if !gateway.registry.contains(svcuid) {
        return Err(invalid_token());
    }

    let response = obj_map! { b"isValid" => Object::Bool(true) };
    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#ValidateAuthorizationTokenResponse",
            &response,
        )
        .map_err(|_| IpcError::default())
}
