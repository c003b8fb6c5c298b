use std::sync::Arc;

use tracing::warn;
use trellis_bus::call;
use trellis_object::{Fault, Map, Object, obj_map};
use trellis_pool::Handle;

use crate::{
    Gateway, IpcError, IpcErrorCode,
    authz::{authorize, default_matcher},
    dispatch::{Operation, OperationInfo, Service},
    services::require_bytes,
};

pub static SERVICE: Service = Service {
    name: "aws.greengrass.Cli",
    operations: &[
        Operation {
            name: "aws.greengrass#CreateLocalDeployment",
            handler: handle_create_local_deployment,
        },
        Operation {
            name: "aws.greengrass#RestartComponent",
            handler: handle_restart_component,
        },
    ],
};

/// Deployment arguments arrive with model-style camelCase names; the
/// deployment daemon speaks the bus's snake_case.
fn bus_deployment_args<'a>(args: &Map<'a>) -> Map<'a> {
    args.iter()
        .map(|(key, value)| {
            let renamed: &[u8] = match key.as_ref() {
                b"recipeDirectoryPath" => b"recipe_directory_path",
                b"artifactsDirectoryPath" => b"artifacts_directory_path",
                b"rootComponentVersionsToAdd" => b"root_component_versions_to_add",
                b"rootComponentVersionsToRemove" => b"root_component_versions_to_remove",
                b"componentToConfiguration" => b"component_to_configuration",
                other => {
                    warn!(
                        argument = %String::from_utf8_lossy(other),
                        "unhandled deployment argument"
                    );
                    return (key.clone(), value.clone());
                }
            };
            (renamed.to_vec().into(), value.clone())
        })
        .collect()
}

fn handle_create_local_deployment(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    authorize(info, b"", default_matcher).map_err(|_| IpcError::unauthorized())?;

    let call_args = bus_deployment_args(args);
    let deployment_id =
        call("gg_deployment", "create_local_deployment", &call_args).map_err(|err| {
            warn!(%err, "failed to create local deployment");
            IpcError::service("Failed to create local deployment.")
        })?;

    if deployment_id.as_bytes().is_none() {
        warn!("received deployment ID not a string");
        return Err(IpcError::service("Internal error."));
    }

    let response = obj_map! { b"deploymentId" => deployment_id };
    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#CreateLocalDeploymentResponse",
            &response,
        )
        .map_err(|_| IpcError::default())
}

fn handle_restart_component(
    gateway: &Arc<Gateway>,
    info: &OperationInfo,
    args: &Map<'_>,
    handle: Handle,
    stream_id: i32,
) -> Result<(), IpcError> {
    let component_name = require_bytes(args, b"componentName").map_err(|_| {
        IpcError::new(IpcErrorCode::InvalidArguments, "Invalid arguments provided.")
    })?;

    authorize(info, component_name, default_matcher).map_err(|_| {
        warn!("component not authorized to restart component");
        IpcError::new(
            IpcErrorCode::Unauthorized,
            "Component not authorized to restart component.",
        )
    })?;

    let mut call_args = Map::new();
    call_args.insert(b"component_name".as_slice(), Object::bytes(component_name));

    let restart_status = match call("gg_health", "restart_component", &call_args) {
        Ok(_) => "SUCCEEDED",
        Err(err) => {
            warn!(%err, "failed to restart component");
            if err.remote() == Some(Fault::NoEntry) {
                return Err(IpcError::new(
                    IpcErrorCode::ResourceNotFound,
                    "Component not found.",
                ));
            }
            "FAILED"
        }
    };

    let response = obj_map! { b"restartStatus" => Object::str(restart_status) };
    gateway
        .response_send(
            handle,
            stream_id,
            "aws.greengrass#RestartComponentResponse",
            &response,
        )
        .map_err(|_| IpcError::default())
}
