//! Runtime configuration.
//!
//! Layered the way `figment` is meant to be used: compiled-in defaults,
//! optionally overridden by a TOML file, optionally overridden again by
//! `LEECH_*` environment variables. Later layers win.
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of simultaneous peer connections.
    pub max_peers: usize,
    /// Block size requested from peers, in bytes.
    pub block_size: u32,
    /// Maximum outstanding block requests kept in flight per peer.
    pub request_window: usize,
    /// Seconds of silence from a peer before the connection is dropped.
    pub dead_timeout_secs: u64,
    /// Seconds between keepalive messages sent to an idle peer.
    pub keepalive_interval_secs: u64,
    /// Directory completed and in-progress files are written under.
    pub download_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 50,
            block_size: crate::piece::BLOCK_SIZE,
            request_window: crate::piece::DEFAULT_REQUEST_WINDOW,
            dead_timeout_secs: 120,
            keepalive_interval_secs: 90,
            download_root: PathBuf::from("./downloads"),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional TOML file, and
    /// `LEECH_*` environment variables, in that order of precedence.
    ///
    /// `dev` shortens the dead-peer timeout to make local testing against
    /// slow or throttled peers less tedious; it is itself overridable by
    /// `LEECH_DEAD_TIMEOUT_SECS` since env is the outermost layer.
    pub fn load(config_file: Option<&Path>, dev: bool) -> ConfigResult<Self> {
        let mut defaults = Config::default();
        if dev {
            defaults.dead_timeout_secs = 30;
        }

        let mut figment = Figment::from(Serialized::defaults(defaults));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("LEECH_"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configuration values that would silently break scheduling
    /// further downstream instead of failing fast at load time.
    fn validate(&self) -> ConfigResult<()> {
        if self.request_window < 1 {
            return Err(ConfigError::Invalid(format!(
                "request_window must be at least 1, got {}",
                self.request_window
            )));
        }
        let max_block_size = 1024 * 1024;
        if self.block_size == 0 || !self.block_size.is_power_of_two() || self.block_size > max_block_size {
            return Err(ConfigError::Invalid(format!(
                "block_size must be a power of two no greater than {max_block_size}, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_overrides() {
        let config = Config::load(None, false).unwrap();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.dead_timeout_secs, 120);
    }

    #[test]
    fn dev_flag_shortens_dead_timeout() {
        let config = Config::load(None, true).unwrap();
        assert_eq!(config.dead_timeout_secs, 30);
    }

    #[test]
    fn env_overrides_file_which_overrides_defaults() {
        let path = std::env::temp_dir().join(format!(
            "leech-config-test-{:?}.toml",
            std::thread::current().id()
        ));
        std::fs::write(&path, "max_peers = 10\n").unwrap();
        std::env::set_var("LEECH_MAX_PEERS", "20");

        let config = Config::load(Some(&path), false).unwrap();
        assert_eq!(config.max_peers, 20);

        std::env::remove_var("LEECH_MAX_PEERS");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_zero_request_window() {
        std::env::set_var("LEECH_REQUEST_WINDOW", "0");
        let result = Config::load(None, false);
        std::env::remove_var("LEECH_REQUEST_WINDOW");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        std::env::set_var("LEECH_BLOCK_SIZE", "12345");
        let result = Config::load(None, false);
        std::env::remove_var("LEECH_BLOCK_SIZE");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
