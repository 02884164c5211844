pub mod config;
pub mod error;
pub mod gateway;
pub mod host;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod server;
pub mod store;
pub mod timer;

pub use host::{Event, Host};
pub use locks::LockManager;
