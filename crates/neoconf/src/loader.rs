//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, NeoConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/neofabric/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("neofabric/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("neofabric.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<NeoConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut NeoConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("NEO_IPC_HOST") {
        config.hub.host = v;
        sources.env_overrides.push("NEO_IPC_HOST".to_string());
    }
    if let Ok(v) = env::var("NEO_IPC_PORT") {
        if let Ok(port) = v.parse() {
            config.hub.port = port;
            sources.env_overrides.push("NEO_IPC_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DISCOVERY_PORT") {
        if let Ok(port) = v.parse() {
            config.hub.discovery_port = port;
            sources.env_overrides.push("DISCOVERY_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("ETCD_PREFIX") {
        config.discovery.etcd_prefix = v;
        sources.env_overrides.push("ETCD_PREFIX".to_string());
    }
    if let Ok(v) = env::var("NEOFABRIC_LOG_LEVEL") {
        config.hub.log_level = v;
        sources.env_overrides.push("NEOFABRIC_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins when both are set
    if let Ok(v) = env::var("RUST_LOG") {
        config.hub.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
