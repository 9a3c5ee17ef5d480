//! Configuration directory resolution
//!
//! All rodent components persist their state under a single configuration
//! directory: `/etc/rodent` by default, overridable with `RODENT_CONFIG_DIR`.
//! Components take the directory as a constructor argument; tests point it
//! at a temporary directory.

use std::path::PathBuf;

/// Default configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/rodent";

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "RODENT_CONFIG_DIR";

/// Resolve the process-wide configuration directory.
///
/// `RODENT_CONFIG_DIR` wins when set and non-empty.
pub fn config_dir() -> PathBuf {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_CONFIG_DIR),
    }
}

/// Get a configuration value from the environment with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a boolean configuration value from the environment.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}
