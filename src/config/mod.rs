//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`CHATWIRE_*`)
//!
//! The `[modules]` section is the only caller-facing control over which
//! negotiation states participate in a connection walk: disabling a module
//! removes all of its state descriptors from the candidate set.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote endpoint configuration
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Optional-module enablement
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Outbound writer configuration
    #[serde(default)]
    pub writer: WriterConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| WireError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| WireError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location
    /// (`$XDG_CONFIG_HOME/chatwire/chatwire.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chatwire").join("chatwire.toml"))
    }

    /// Load the default config file when present, then apply environment
    /// overrides on top.
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        Ok(base.apply_env())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Apply `CHATWIRE_*` environment overrides to this configuration
    pub fn apply_env(self) -> Self {
        let mut config = self;

        if let Ok(host) = std::env::var("CHATWIRE_HOST") {
            config.endpoint.host = host;
        }
        if let Ok(port) = std::env::var("CHATWIRE_PORT") {
            if let Ok(port) = port.parse() {
                config.endpoint.port = port;
            }
        }
        if let Ok(domain) = std::env::var("CHATWIRE_DOMAIN") {
            config.endpoint.domain = domain;
        }
        if let Ok(val) = std::env::var("CHATWIRE_QUEUE_CAPACITY") {
            if let Ok(val) = val.parse() {
                config.writer.queue_capacity = val;
            }
        }
        if let Ok(val) = std::env::var("CHATWIRE_DISABLE_TLS") {
            if val == "1" || val.eq_ignore_ascii_case("true") {
                config.modules.tls = false;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(self, other: Self) -> Self {
        let defaults = EndpointConfig::default();
        Self {
            endpoint: EndpointConfig {
                host: if other.endpoint.host != defaults.host {
                    other.endpoint.host
                } else {
                    self.endpoint.host
                },
                port: if other.endpoint.port != defaults.port {
                    other.endpoint.port
                } else {
                    self.endpoint.port
                },
                domain: if other.endpoint.domain != defaults.domain {
                    other.endpoint.domain
                } else {
                    self.endpoint.domain
                },
                ..other.endpoint
            },
            modules: other.modules,
            writer: other.writer,
            tls: other.tls,
        }
    }
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Server host to connect to
    pub host: String,

    /// Server port
    pub port: u16,

    /// Service domain (also used as the TLS server name)
    pub domain: String,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Per-negotiation-step timeout in seconds
    pub step_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5222,
            domain: "localhost".to_string(),
            connect_timeout_secs: 30,
            step_timeout_secs: 30,
        }
    }
}

impl EndpointConfig {
    /// Get the full remote address
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-step timeout as a [`Duration`]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Optional-module enablement flags.
///
/// Each flag owns one or more state descriptors; a disabled module
/// contributes none of them to the walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Negotiate a TLS channel upgrade before authenticating
    pub tls: bool,

    /// Negotiate frame-level compression after authenticating
    pub compression: bool,

    /// Enable the stream-management ledger and resumption
    pub stream_management: bool,

    /// Attempt instant resumption (skip auth/bind on reconnect)
    pub instant_resume: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            tls: true,
            compression: false,
            stream_management: true,
            instant_resume: true,
        }
    }
}

/// Policy for pending stanzas when the writer shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Write out everything still queued before closing
    #[default]
    Flush,
    /// Drop everything still queued
    Discard,
}

/// Outbound writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Bounded queue capacity; producers block when full
    pub queue_capacity: usize,

    /// What to do with queued stanzas on shutdown
    pub drain: DrainPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            drain: DrainPolicy::Flush,
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Optional PEM file with additional trusted root certificates;
    /// the webpki root store is used when absent
    pub ca_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint.port, 5222);
        assert!(config.modules.tls);
        assert!(config.modules.stream_management);
        assert_eq!(config.writer.queue_capacity, 64);
        assert_eq!(config.writer.drain, DrainPolicy::Flush);
    }

    #[test]
    fn test_remote_addr() {
        let config = EndpointConfig::default();
        assert_eq!(config.remote_addr(), "localhost:5222");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [endpoint]
            host = "chat.example.net"
            port = 5223
            domain = "example.net"
            connect_timeout_secs = 10
            step_timeout_secs = 15

            [modules]
            tls = true
            compression = true
            stream_management = true
            instant_resume = false

            [writer]
            queue_capacity = 128
            drain = "discard"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.endpoint.host, "chat.example.net");
        assert_eq!(config.endpoint.port, 5223);
        assert!(config.modules.compression);
        assert!(!config.modules.instant_resume);
        assert_eq!(config.writer.queue_capacity, 128);
        assert_eq!(config.writer.drain, DrainPolicy::Discard);
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = Config::default();
        let mut over = Config::default();
        over.endpoint.host = "relay.example.org".to_string();
        over.modules.compression = true;

        let merged = base.merge(over);
        assert_eq!(merged.endpoint.host, "relay.example.org");
        assert_eq!(merged.endpoint.port, 5222);
        assert!(merged.modules.compression);
    }
}
