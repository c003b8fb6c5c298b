mod server;
mod store;

pub use server::{INTERFACE, methods};
pub use store::ConfigStore;
