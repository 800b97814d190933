//! Configuration loading for Neofabric processes.
//!
//! No process-wide state: loading produces plain values that are passed
//! into constructors. Every field has a compiled default, so an empty (or
//! absent) config file is valid.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/neofabric/config.toml` (system)
//! 2. `~/.config/neofabric/config.toml` (user)
//! 3. `./neofabric.toml` (local override, or `--config` path)
//! 4. Environment variables
//!
//! # Environment Overrides
//!
//! `NEO_IPC_HOST`, `NEO_IPC_PORT`, `DISCOVERY_PORT`, `ETCD_PREFIX`,
//! `NEOFABRIC_LOG_LEVEL` (and `RUST_LOG`, which wins).
//!
//! # Example Config
//!
//! ```toml
//! [hub]
//! host = "0.0.0.0"
//! port = 9999
//! discovery_port = 9090
//! session_timeout_secs = 90
//!
//! [discovery]
//! service_ttl_secs = 30
//!
//! [protocol]
//! compression = "gzip"
//! ```

mod loader;

pub use loader::{discover_config_files, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Hub process settings: bind addresses and session/request timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Host the hub and discovery endpoint bind to.
    pub host: String,
    /// Port for fabric traffic.
    pub port: u16,
    /// Port for the discovery endpoint.
    pub discovery_port: u16,
    /// Close a session whose last heartbeat is older than this.
    pub session_timeout_secs: u64,
    /// Age out routing entries (in-flight requests) after this long.
    pub request_timeout_secs: u64,
    /// How long graceful shutdown waits for in-flight work.
    pub drain_timeout_secs: u64,
    /// Heartbeat reaper cadence.
    pub reap_interval_secs: u64,
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9999,
            discovery_port: 9090,
            session_timeout_secs: 90,
            request_timeout_secs: 30,
            drain_timeout_secs: 10,
            reap_interval_secs: 15,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Service-discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Registry lease length; entries expire without renewal.
    pub service_ttl_secs: u64,
    /// Key prefix for deployments that mirror the registry into an
    /// external KV. The mirror itself is external tooling.
    pub etcd_prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_ttl_secs: 30,
            etcd_prefix: "/services".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs(self.service_ttl_secs)
    }
}

/// Wire protocol settings shared by every peer in the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub version: u8,
    /// Default payload compression: none, gzip, zstd, or lz4.
    pub compression: String,
    pub max_frame_bytes: usize,
    pub enable_checksum: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: 1,
            compression: "none".to_string(),
            max_frame_bytes: 10 * 1024 * 1024,
            enable_checksum: true,
        }
    }
}

/// Root configuration for a Neofabric process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NeoConfig {
    pub hub: HubConfig,
    pub discovery: DiscoveryConfig,
    pub protocol: ProtocolConfig,
}

impl NeoConfig {
    /// Load from standard locations plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources_from(None).map(|(config, _)| config)
    }

    /// Load, optionally honoring a CLI-supplied config path, and report
    /// where values came from.
    pub fn load_with_sources_from(
        cli_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = NeoConfig::default();

        for path in loader::discover_config_files_with_override(cli_path) {
            config = loader::load_from_file(&path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        Ok((config, sources))
    }

    /// Validate cross-field constraints. Returns human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.protocol.max_frame_bytes == 0 {
            errors.push("protocol.max_frame_bytes must be greater than 0".to_string());
        }
        if !matches!(
            self.protocol.compression.as_str(),
            "none" | "gzip" | "zstd" | "lz4"
        ) {
            errors.push(format!(
                "protocol.compression must be one of none, gzip, zstd, lz4 (got '{}')",
                self.protocol.compression
            ));
        }
        if self.hub.session_timeout_secs == 0 {
            errors.push("hub.session_timeout_secs must be greater than 0".to_string());
        }
        if self.discovery.service_ttl_secs == 0 {
            errors.push("discovery.service_ttl_secs must be greater than 0".to_string());
        }
        errors
    }

    /// Render as TOML (for `--show-config`).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NeoConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.hub.port, 9999);
        assert_eq!(config.hub.discovery_port, 9090);
        assert_eq!(config.discovery.service_ttl(), Duration::from_secs(30));
        assert_eq!(config.discovery.etcd_prefix, "/services");
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = NeoConfig::default();
        config.protocol.compression = "snappy".to_string();
        config.protocol.max_frame_bytes = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn toml_roundtrip() {
        let config = NeoConfig::default();
        let rendered = config.to_toml();
        let parsed: NeoConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.hub.port, config.hub.port);
        assert_eq!(parsed.protocol.compression, config.protocol.compression);
    }
}
