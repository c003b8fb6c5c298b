use std::path::PathBuf;

use tracing::warn;
use trellis_object::Fault;

/// Interface names name socket files; keep them short and ASCII.
pub const MAX_INTERFACE_NAME_LEN: usize = 50;

const SOCKET_DIR_ENV: &str = "TRELLIS_SOCKET_DIR";
const DEFAULT_SOCKET_DIR: &str = "/run/trellis";

/// Directory holding the per-interface bus sockets.
///
/// Overridable through the environment so tests and unprivileged runs
/// can point the fabric at a scratch directory.
pub fn socket_dir() -> PathBuf {
    std::env::var_os(SOCKET_DIR_ENV)
        .map_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR), PathBuf::from)
}

/// Socket path for a bus interface, after validating the name.
pub fn interface_socket_path(interface: &str) -> Result<PathBuf, Fault> {
    if interface.is_empty() || interface.len() > MAX_INTERFACE_NAME_LEN {
        warn!(interface, "interface name length invalid");
        return Err(Fault::Range);
    }
    if !interface.bytes().all(|b| b.is_ascii() && b != b'/' && b != 0) {
        warn!(interface, "interface name has invalid bytes");
        return Err(Fault::Invalid);
    }
    Ok(socket_dir().join(interface))
}
