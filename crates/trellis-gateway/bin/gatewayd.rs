use std::{path::PathBuf, sync::Arc};

use tracing::error;
use tracing_subscriber::EnvFilter;
use trellis_bus::{SubscriptionClient, api::config as cfg};
use trellis_gateway::{ComponentRegistry, DenyPeers, Gateway, serve_verify_interface};

const GATEWAY_SOCKET_NAME: &str = "gg-ipc.socket";

/// Explicit override, else `<system/rootPath from config>/gg-ipc.socket`.
fn gateway_socket_path() -> Result<PathBuf, trellis_bus::CallError> {
    if let Some(path) = std::env::var_os("TRELLIS_GATEWAY_SOCKET") {
        return Ok(PathBuf::from(path));
    }
    let root = cfg::read_str(&[b"system", b"rootPath"])?;
    let root = PathBuf::from(String::from_utf8_lossy(&root).into_owned());
    Ok(root.join(GATEWAY_SOCKET_NAME))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    SubscriptionClient::start();

    let socket_path = match gateway_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(%err, "failed to resolve gateway socket path");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(ComponentRegistry::new());
    if let Err(err) = serve_verify_interface(Arc::clone(&registry)) {
        error!(?err, "failed to start ipc_component interface");
        std::process::exit(1);
    }

    // Peer-credential authentication needs the process supervisor; a
    // standalone gateway only accepts token connects.
    let gateway = Gateway::new(registry, Box::new(DenyPeers));
    if let Err(err) = gateway.listen(&socket_path) {
        error!(?err, "gatewayd exiting");
        std::process::exit(1);
    }
}
