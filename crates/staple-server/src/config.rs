//! Daemon configuration
//!
//! Loaded from a JSON file. Globals cover the HTTP listener, the monitor
//! cadence, fetch behavior, and the on-disk cache folder; each monitored
//! certificate adds a definition that may override the upstream responder
//! list or proxy when its `override_global_*` flag is set.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use staple_cache::{CertDefinition, EntryDefaults};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the OCSP responder listens on
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Seconds between monitor wake-ups
    #[serde(default = "default_monitor_tick_secs")]
    pub monitor_tick_secs: u64,

    /// Per-fetch deadline in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Seconds slept before retrying a failed fetch once (0 disables the retry)
    #[serde(default)]
    pub base_backoff_secs: u64,

    /// Keep serving a response past its nextUpdate instead of answering
    /// tryLater
    #[serde(default)]
    pub dont_die_on_stale_response: bool,

    /// Folder for on-disk response snapshots; unset disables persistence
    #[serde(default)]
    pub cache_folder: Option<String>,

    /// Default upstream OCSP responder URLs
    #[serde(default)]
    pub upstream_responders: Vec<String>,

    /// Default HTTP proxy URI for upstream fetches
    #[serde(default)]
    pub proxy: Option<String>,

    /// Monitored certificates
    #[serde(default)]
    pub certificates: Vec<CertDefinition>,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_monitor_tick_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// A starting-point configuration with one monitored certificate
    pub fn example() -> Self {
        Self {
            http_addr: default_http_addr(),
            log_level: Some("info".to_string()),
            monitor_tick_secs: default_monitor_tick_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            base_backoff_secs: 0,
            dont_die_on_stale_response: false,
            cache_folder: Some("/var/cache/staplerd".to_string()),
            upstream_responders: vec!["http://ocsp.example.net".to_string()],
            proxy: None,
            certificates: vec![CertDefinition {
                certificate: Some("/etc/ssl/example.org.pem".to_string()),
                issuer: Some("/etc/ssl/example-ca.pem".to_string()),
                ..CertDefinition::default()
            }],
        }
    }

    /// Check the parts of the configuration that can fail before any
    /// certificate file is touched
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "http_addr '{}' is not a socket address",
                self.http_addr
            )));
        }
        if self.monitor_tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor_tick_secs must be non-zero".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be non-zero".to_string(),
            ));
        }
        for (index, def) in self.certificates.iter().enumerate() {
            let has_cert = def.certificate.is_some();
            let has_pair = def.name.is_some() && def.serial.is_some();
            if !has_cert && !has_pair {
                return Err(ConfigError::Invalid(format!(
                    "certificates[{index}]: either certificate or name and serial must be provided"
                )));
            }
        }
        Ok(())
    }

    /// Listener address; call after [`Config::validate`]
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "http_addr '{}' is not a socket address",
                self.http_addr
            ))
        })
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_secs(self.monitor_tick_secs)
    }

    /// Globals handed to entry construction
    pub fn entry_defaults(&self) -> EntryDefaults {
        EntryDefaults {
            responders: self.upstream_responders.clone(),
            proxy: self.proxy.clone(),
            cache_folder: self.cache_folder.as_ref().map(PathBuf::from),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            base_backoff: Duration::from_secs(self.base_backoff_secs),
        }
    }
}
