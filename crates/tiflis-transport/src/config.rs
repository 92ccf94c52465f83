//! Relay configuration.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::{protocol::MIN_API_KEY_LEN, registry::RegistryConfig};

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API key must be at least {MIN_API_KEY_LEN} characters")]
    ApiKeyTooShort,
    #[error("Heartbeat timeout ({timeout_ms} ms) must not be shorter than the interval ({interval_ms} ms)")]
    HeartbeatTimeout { interval_ms: u64, timeout_ms: u64 },
    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
}

/// Relay server settings, from flags or environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "tiflis-relay", version, about = "WebSocket relay between workstations and clients")]
pub struct RelayConfig {
    /// Address to listen on.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "RELAY_PORT", default_value_t = 3001)]
    pub port: u16,

    /// Key workstations must present to register.
    #[arg(long, env = "RELAY_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Public URL reported to registered workstations.
    #[arg(long, env = "RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Expected ping interval of peers.
    #[arg(long, env = "RELAY_HEARTBEAT_INTERVAL_MS", default_value_t = 20_000)]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a connection is closed.
    #[arg(long, env = "RELAY_HEARTBEAT_TIMEOUT_MS", default_value_t = 30_000)]
    pub heartbeat_timeout_ms: u64,

    /// How long an offline workstation's tunnel is kept for reclaim.
    #[arg(long, env = "RELAY_OFFLINE_GRACE_SECS", default_value_t = 30)]
    pub offline_grace_secs: u64,
}

impl RelayConfig {
    /// Settings for a local relay, used by tests and demos.
    #[must_use]
    pub fn local(api_key: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            api_key: api_key.into(),
            public_url: None,
            heartbeat_interval_ms: 20_000,
            heartbeat_timeout_ms: 30_000,
            offline_grace_secs: 30,
        }
    }

    /// Check the settings before starting.
    ///
    /// # Errors
    /// Returns error for a short API key, a timeout below the interval or a
    /// bad listen address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.len() < MIN_API_KEY_LEN {
            return Err(ConfigError::ApiKeyTooShort);
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::HeartbeatTimeout {
                interval_ms: self.heartbeat_interval_ms,
                timeout_ms: self.heartbeat_timeout_ms,
            });
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Socket address to bind.
    ///
    /// # Errors
    /// Returns error if host and port do not form an address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            api_key: self.api_key.clone(),
            public_url: self.public_url.clone(),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            offline_grace: Duration::from_secs(self.offline_grace_secs),
        }
    }
}
