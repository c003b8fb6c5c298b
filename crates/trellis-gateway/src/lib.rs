mod auth;
mod authz;
mod components;
mod dispatch;
mod error;
mod json;
mod server;
mod services;
mod subscriptions;

pub use auth::{DenyPeers, PeerAuth};
pub use components::{ComponentHandle, ComponentRegistry, Svcuid, serve_verify_interface};
pub use error::{IpcError, IpcErrorCode};
pub use server::Gateway;
