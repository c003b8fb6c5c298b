use std::sync::Arc;

use tracing::{info, warn};
use trellis_object::Map;
use trellis_pool::Handle;

use crate::{ComponentHandle, Gateway, IpcError, services};

/// Context handed to every operation handler.
pub struct OperationInfo {
    /// IPC service namespace, e.g. `aws.greengrass.ipc.mqttproxy`;
    /// authorization policies key off it.
    pub service: &'static str,
    /// Full operation name, e.g. `aws.greengrass#PublishToIoTCore`.
    pub operation: &'static str,
    /// The calling component's registered name.
    pub component: Vec<u8>,
}

pub type OperationHandler =
    fn(&Arc<Gateway>, &OperationInfo, &Map<'_>, Handle, i32) -> Result<(), IpcError>;

pub struct Operation {
    pub name: &'static str,
    pub handler: OperationHandler,
}

pub struct Service {
    pub name: &'static str,
    pub operations: &'static [Operation],
}

static SERVICES: &[&Service] = &[
    &services::pubsub::SERVICE,
    &services::mqttproxy::SERVICE,
    &services::config::SERVICE,
    &services::cli::SERVICE,
    &services::private::SERVICE,
    &services::lifecycle::SERVICE,
    &services::authagent::SERVICE,
];

/// Resolves `operation` in the two-level service table and invokes its
/// handler with the caller's identity attached.
pub fn handle_operation(
    gateway: &Arc<Gateway>,
    operation: &[u8],
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
    component: ComponentHandle,
) -> Result<(), IpcError> {
    for service in SERVICES {
        for op in service.operations {
            if op.name.as_bytes() != operation {
                continue;
            }

            let info = OperationInfo {
                service: service.name,
                operation: op.name,
                component: gateway.registry.name_of(component),
            };
            info!(
                operation = op.name,
                component = %String::from_utf8_lossy(&info.component),
                "received IPC operation"
            );
            return (op.handler)(gateway, &info, args, handle, stream_id);
        }
    }

    warn!(
        operation = %String::from_utf8_lossy(operation),
        "unhandled operation requested"
    );
    Err(IpcError::default())
}
