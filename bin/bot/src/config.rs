//! Centralized bot configuration.
//!
//! Loaded via the `config` crate from an optional TOML file (path from
//! `PALAVER_CONFIG`, default `palaver.toml`) and environment variables with
//! the `PALAVER` prefix and `__` as the nesting separator, e.g.
//! `PALAVER__SCOPE__TTL_SECONDS=600`.

use palaver_dispatch::{DispatcherConfig, ProcessorConfig, RoutingAnchor};
use palaver_transport::NatsConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "PALAVER_CONFIG";

/// Configuration file used when [`CONFIG_PATH_VAR`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "palaver.toml";

/// Bot configuration composed from library configs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    /// NATS connection and resource names.
    #[serde(default)]
    pub nats: NatsConfig,

    /// Session scope settings.
    #[serde(default)]
    pub scope: ScopeSettings,

    /// Inbound event handling.
    #[serde(default)]
    pub ingress: IngressSettings,
}

/// Session scope settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeSettings {
    /// Seconds an idle scope survives before expiring.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Which event continuation turns are routed by.
    #[serde(default)]
    pub routing_anchor: RoutingAnchor,
}

/// Inbound event handling.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressSettings {
    /// Accept every participation request.
    #[serde(default)]
    pub auto_accept: bool,

    /// Seconds a per-sender worker waits for more events before retiring.
    #[serde(default = "default_worker_idle_seconds")]
    pub worker_idle_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    3600
}

fn default_worker_idle_seconds() -> u64 {
    30
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            routing_anchor: RoutingAnchor::default(),
        }
    }
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            auto_accept: false,
            worker_idle_seconds: default_worker_idle_seconds(),
        }
    }
}

impl BotConfig {
    /// Loads configuration from the file named by `PALAVER_CONFIG` (or
    /// `palaver.toml`) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value has the wrong type.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(Path::new(&path))
    }

    /// Loads configuration from `path`, if it exists, and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value has the wrong type.
    pub fn from_file(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("PALAVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Returns the scope TTL.
    #[must_use]
    pub fn scope_ttl(&self) -> Duration {
        Duration::from_secs(self.scope.ttl_seconds)
    }

    /// Returns the session processor configuration.
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            routing_anchor: self.scope.routing_anchor,
        }
    }

    /// Returns the dispatcher configuration.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_idle: Duration::from_secs(self.ingress.worker_idle_seconds),
        }
    }
}
