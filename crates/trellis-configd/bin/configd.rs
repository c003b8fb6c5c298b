use std::sync::Arc;

use tracing::error;
use tracing_subscriber::EnvFilter;
use trellis_bus::BusServer;
use trellis_configd::{ConfigStore, INTERFACE, methods};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = Arc::new(ConfigStore::default());
    let server = BusServer::new(methods(store));

    if let Err(err) = server.listen(INTERFACE) {
        error!(?err, "configd exiting");
        std::process::exit(1);
    }
}
