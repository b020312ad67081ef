//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Configuration for the race-timing server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Per-connection outbound queue length before messages are dropped.
    pub max_send_queue: usize,
    /// Heartbeat ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Drop a connection after this many seconds without a pong.
    pub client_timeout_secs: u64,
    /// Browser origin allowed by CORS. `None` allows any origin.
    pub allowed_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            allowed_origin: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `HOST`, `PORT`, `CLIENT_URL`,
    /// `LANECLOCK_SEND_QUEUE`, `LANECLOCK_HEARTBEAT_SECS` and
    /// `LANECLOCK_CLIENT_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(origin) = lookup("CLIENT_URL").filter(|o| !o.is_empty()) {
            config.allowed_origin = Some(origin);
        }
        if let Some(queue) = parse_var(&lookup, "LANECLOCK_SEND_QUEUE")? {
            config.max_send_queue = queue;
        }
        if let Some(secs) = parse_var(&lookup, "LANECLOCK_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "LANECLOCK_CLIENT_TIMEOUT_SECS")? {
            config.client_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_send_queue",
                value: "0".into(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_secs",
                value: "0".into(),
            });
        }
        if self.client_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue {
                key: "client_timeout_secs",
                value: self.client_timeout_secs.to_string(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}
