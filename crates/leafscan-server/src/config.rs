//! Server configuration
//!
//! Layered with the `config` crate: an optional YAML file, then `LEAFSCAN__*`
//! environment variables (`LEAFSCAN__SERVER__PORT=9000`), then command-line
//! overrides applied by the binary.

use anyhow::{Context, Result};
use leafscan_classifiers::PredictorConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration for the `leafscan` binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub predictor: PredictorConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted upload in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional YAML file and `LEAFSCAN__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("LEAFSCAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Apply command-line overrides
    pub fn with_overrides(mut self, listen: Option<String>, port: Option<u16>) -> Self {
        if let Some(listen) = listen {
            self.server.listen = listen;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.listen, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    self.server.listen, self.server.port
                )
            })
    }
}
