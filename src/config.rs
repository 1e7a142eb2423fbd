//! Endpoint configuration.
//!
//! Loaded from JSON text or from `DUPLEX_RPC_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::jsonrpc::codec::Dialect;

pub const ENV_DIALECT: &str = "DUPLEX_RPC_DIALECT";
pub const ENV_TRACE: &str = "DUPLEX_RPC_TRACE";
pub const ENV_ABANDON_PENDING: &str = "DUPLEX_RPC_ABANDON_PENDING";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown dialect '{0}'")]
    UnknownDialect(String),

    #[error("invalid value '{value}' for {name}")]
    InvalidFlag { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    pub dialect: Dialect,
    /// Resolve outstanding requests with a closed-channel error when the input ends
    pub abandon_pending_on_close: bool,
    /// Write a human-readable message trace to stderr
    pub trace_messages: bool,
}

impl EndpointConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Defaults overridden by whichever `DUPLEX_RPC_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_DIALECT) {
            config.dialect = Dialect::parse(value.trim()).ok_or(ConfigError::UnknownDialect(value))?;
        }
        if let Some(value) = lookup(ENV_TRACE) {
            config.trace_messages = parse_flag(ENV_TRACE, &value)?;
        }
        if let Some(value) = lookup(ENV_ABANDON_PENDING) {
            config.abandon_pending_on_close = parse_flag(ENV_ABANDON_PENDING, &value)?;
        }
        log::debug!("Loaded endpoint config from environment: {:?}", config);
        Ok(config)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
