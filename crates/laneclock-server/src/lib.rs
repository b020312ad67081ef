pub mod client;
pub mod config;
pub mod gateway;
pub mod protocol;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use gateway::{Delivery, SessionGateway};
pub use server::{start, start_with_clock, ServerError, ServerHandle};
