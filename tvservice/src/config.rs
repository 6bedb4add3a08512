//! Configuration file format for `tvserviced`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::descrambler::{CwcConfig, CwcServerConfig};
use crate::service::{RegistryConfig, ServiceSettings};

/// Default configuration file name, picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tvserviced.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub logging: LoggingSection,
    pub registry: RegistrySection,
    pub cwc: CwcSection,
    #[serde(rename = "service")]
    pub services: Vec<ServiceSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub log_dir: PathBuf,
    pub retention_days: u64,
    /// Filter directive, e.g. `info` or `tvservice=debug`.
    pub level: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Grace period of the file feed: how long a fresh start may go
    /// without packets before its instance is marked failed.
    pub grace_period_secs: u64,
    pub receive_timeout_secs: u64,
    pub instance_error_hold_secs: u64,
    pub pad_queue_len: usize,
    pub filter_languages: Vec<String>,
    /// Where the file feed stores service settings.
    pub settings_dir: Option<PathBuf>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            grace_period_secs: 10,
            receive_timeout_secs: defaults.receive_timeout.as_secs(),
            instance_error_hold_secs: defaults.instance_error_hold.as_secs(),
            pad_queue_len: defaults.pad_queue_len,
            filter_languages: defaults.filter_languages,
            settings_dir: None,
        }
    }
}

impl RegistrySection {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
            instance_error_hold: Duration::from_secs(self.instance_error_hold_secs),
            pad_queue_len: self.pad_queue_len,
            filter_languages: self.filter_languages.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CwcSection {
    pub key_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    #[serde(rename = "server")]
    pub servers: Vec<CwcServerSection>,
}

impl Default for CwcSection {
    fn default() -> Self {
        let defaults = CwcConfig::default();
        Self {
            key_timeout_secs: defaults.key_timeout.as_secs(),
            keepalive_interval_secs: defaults.keepalive_interval.as_secs(),
            backoff_min_ms: defaults.backoff_min.as_millis() as u64,
            backoff_max_ms: defaults.backoff_max.as_millis() as u64,
            servers: Vec::new(),
        }
    }
}

impl CwcSection {
    pub fn to_cwc_config(&self) -> CwcConfig {
        CwcConfig {
            servers: self.servers.iter().map(CwcServerSection::to_server_config).collect(),
            key_timeout: Duration::from_secs(self.key_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs.max(1)),
            backoff_min: Duration::from_millis(self.backoff_min_ms.max(1)),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_min_ms)),
            ..CwcConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CwcServerSection {
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub caids: Vec<u16>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

impl CwcServerSection {
    fn to_server_config(&self) -> CwcServerConfig {
        CwcServerConfig {
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            caids: self.caids.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// The explicit path if given, otherwise `tvserviced.toml` when present.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                default_path.exists().then_some(default_path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceType;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConfigFile::parse("").unwrap();
        assert_eq!(config.logging.retention_days, 7);
        assert_eq!(config.registry.to_registry_config().receive_timeout, Duration::from_secs(10));
        assert!(config.cwc.servers.is_empty());
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = ConfigFile::parse(
            r#"
            [logging]
            log_dir = "/var/log/tvservice"
            level = "debug"

            [registry]
            receive_timeout_secs = 3
            filter_languages = ["jpn", "eng"]

            [cwc]
            key_timeout_secs = 2
            backoff_min_ms = 250

            [[cwc.server]]
            address = "10.0.0.5:15000"
            username = "user"
            password = "pass"
            caids = [0x0B00, 0x4AE1]

            [[service]]
            sid = 1024
            pmt_pid = 0x1F0
            provider = "NHK"
            name = "NHK G"
            service_type = "hdtv"
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        let registry = config.registry.to_registry_config();
        assert_eq!(registry.receive_timeout, Duration::from_secs(3));
        assert_eq!(registry.filter_languages, vec!["jpn", "eng"]);

        let cwc = config.cwc.to_cwc_config();
        assert_eq!(cwc.key_timeout, Duration::from_secs(2));
        assert_eq!(cwc.backoff_min, Duration::from_millis(250));
        assert_eq!(cwc.servers.len(), 1);
        assert_eq!(cwc.servers[0].caids, vec![0x0B00, 0x4AE1]);
        assert_eq!(cwc.servers[0].connect_timeout, Duration::from_secs(5));

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].sid, 1024);
        assert_eq!(config.services[0].service_type, ServiceType::Hdtv);
        assert!(config.services[0].enabled);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigFile::load(Path::new("/nonexistent/tvserviced.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
