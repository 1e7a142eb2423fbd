pub mod config;
pub mod jsonrpc;

// 公開API
pub use config::{ConfigError, EndpointConfig};
pub use jsonrpc::*;
