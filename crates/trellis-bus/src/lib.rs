pub mod api;
mod client;
mod paths;
mod server;
mod subscribe;

pub use client::{CallError, call, notify};
pub use paths::{MAX_INTERFACE_NAME_LEN, interface_socket_path, socket_dir};
pub use server::{BusServer, CloseFn, Method};
pub use subscribe::{SubCloseFn, SubResponseFn, SubscriptionClient};
