/// Authority consulted when a component connects with a bare
/// `componentName` and no token: may the connecting process claim that
/// name?
///
/// In production this is answered by the process lifecycle manager,
/// which knows which pid it spawned for which component; that
/// collaborator wires in its own implementation.
pub trait PeerAuth: Send + Sync {
    fn allows(&self, pid: i32, component_name: &[u8]) -> bool;
}

/// Refuses every peer-credential connect. Token-based authentication is
/// unaffected. The safe default when no supervisor is attached.
pub struct DenyPeers;

impl PeerAuth for DenyPeers {
    fn allows(&self, _pid: i32, _component_name: &[u8]) -> bool {
        false
    }
}
