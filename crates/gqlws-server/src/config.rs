//! Server configuration.
//!
//! Loading flow (later sources win):
//! 1. Compiled [`ServerConfig::default()`]
//! 2. Optional JSON file
//! 3. Environment variables prefixed with `GQLWS_` (e.g. `GQLWS_PORT=4000`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "GQLWS_";

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// A source could not be parsed or has wrong types.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

/// What happens to the connection after a query or mutation completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneShotPolicy {
    /// Keep serving further operations on the same connection.
    #[default]
    KeepOpen,
    /// Close the transport once the single result has been delivered.
    Close,
}

/// Configuration for the gqlws server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// HTTP path of the WebSocket endpoint.
    pub path: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
    /// Seconds between `ka` messages; `None` disables keep-alive.
    pub keep_alive_interval_secs: Option<u64>,
    /// Connection handling after a one-shot operation.
    pub one_shot_policy: OneShotPolicy,
    /// Seconds to wait for connections to drain on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/graphql".into(),
            max_connections: 256,
            max_message_size: 1024 * 1024, // 1 MB
            outbound_buffer: 1024,
            keep_alive_interval_secs: None,
            one_shot_policy: OneShotPolicy::KeepOpen,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `path` (if given), then `GQLWS_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            debug!(?path, "loading server config from file");
            figment = figment.merge(Json::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket endpoint path, always starting with `/`.
    pub fn endpoint_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }

    /// Keep-alive interval, if enabled. Zero counts as disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
