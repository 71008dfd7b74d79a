//! Configuration management for the image edge cache

use crate::error::{EdgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded once at startup and shared immutably
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Base directory holding one subdirectory per storage sub-path
    /// (default: files/)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Response caching and fetch behaviour
    #[serde(default)]
    pub cache: CacheConfig,

    /// Content negotiation settings
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Access log settings
    #[serde(default)]
    pub log: LogConfig,

    /// Background eviction settings
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Idle connection timeout in seconds (default: 120)
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,

    /// Map error payloads to 404/5xx instead of the always-200 behaviour
    /// (default: false)
    #[serde(default)]
    pub strict_status_codes: bool,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether to emit Cache-Control, Expires and ETag headers (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// max-age advertised to clients, in seconds (default: 3600)
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Serialize concurrent fetches of the same cache key (default: true)
    #[serde(default = "default_true")]
    pub coalesce_fetches: bool,

    /// TCP connect timeout for origin requests, in seconds (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Content negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationConfig {
    /// Re-encode to WebP for capable clients (default: true)
    #[serde(default = "default_true")]
    pub webp: bool,
}

/// Access log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Whether to emit access events (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Retention hint attached to each event, in seconds (default: 30 days)
    #[serde(default = "default_log_ttl")]
    pub ttl_secs: u64,

    /// Append events as JSON lines to this file instead of the tracing log
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Eviction sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvictionConfig {
    /// Whether the sweeper runs (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweep cycles (default: 3600)
    #[serde(default = "default_eviction_interval")]
    pub interval_secs: u64,

    /// Files older than this many seconds are deleted (default: 3600)
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Concurrent stat/delete operations per directory (default: 5)
    #[serde(default = "default_eviction_concurrency")]
    pub concurrency: usize,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("files")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_server_timeout() -> u64 {
    120 // 2 minutes
}

fn default_max_age() -> u64 {
    3600 // 1 hour
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_ttl() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_eviction_interval() -> u64 {
    3600
}

fn default_eviction_concurrency() -> usize {
    5
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_server_timeout(),
            strict_status_codes: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_age_secs: default_max_age(),
            coalesce_fetches: default_true(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { webp: default_true() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_log_ttl(),
            path: None,
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_eviction_interval(),
            max_age_secs: default_max_age(),
            concurrency: default_eviction_concurrency(),
        }
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            server: ServerConfig::default(),
            base_dir: default_base_dir(),
            cache: CacheConfig::default(),
            negotiation: NegotiationConfig::default(),
            log: LogConfig::default(),
            eviction: EvictionConfig::default(),
            metrics_endpoint: None,
        }
    }
}

impl EdgeConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(EdgeConfig)` if loading and validation succeed
    /// * `Err(EdgeError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| EdgeError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EdgeConfig = serde_yaml::from_str(content)
            .map_err(|e| EdgeError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply a `PORT` override, as read from the environment
    ///
    /// Invalid values are rejected rather than silently ignored.
    pub fn with_port_override(mut self, port: Option<&str>) -> Result<Self> {
        if let Some(raw) = port {
            self.server.port = raw
                .trim()
                .parse::<u16>()
                .map_err(|e| EdgeError::Config(format!("Invalid PORT '{}': {}", raw, e)))?;
            self.validate()?;
        }
        Ok(self)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - server.port must be > 0 and server.timeout_secs must be > 0
    /// - base_dir must not be empty
    /// - cache.max_age_secs must be in (0, 10 years] when caching is enabled
    /// - eviction.interval_secs and eviction.max_age_secs must be > 0
    /// - eviction.concurrency must be between 1 and 64
    /// - metrics_endpoint.address must parse as a socket address
    pub fn validate(&self) -> Result<()> {
        const MAX_EVICTION_CONCURRENCY: usize = 64;
        const MAX_CACHE_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

        if self.server.port == 0 {
            return Err(EdgeError::Config(
                "server.port must be greater than 0".to_string(),
            ));
        }

        if self.server.timeout_secs == 0 {
            return Err(EdgeError::Config(
                "server.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.base_dir.as_os_str().is_empty() {
            return Err(EdgeError::Config("base_dir must not be empty".to_string()));
        }

        if self.cache.enabled && self.cache.max_age_secs == 0 {
            return Err(EdgeError::Config(
                "cache.max_age_secs must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.max_age_secs > MAX_CACHE_AGE_SECS {
            return Err(EdgeError::Config(format!(
                "cache.max_age_secs must be at most {}, got {}",
                MAX_CACHE_AGE_SECS, self.cache.max_age_secs
            )));
        }

        if self.eviction.interval_secs == 0 {
            return Err(EdgeError::Config(
                "eviction.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.eviction.max_age_secs == 0 {
            return Err(EdgeError::Config(
                "eviction.max_age_secs must be greater than 0".to_string(),
            ));
        }

        if self.eviction.concurrency == 0 || self.eviction.concurrency > MAX_EVICTION_CONCURRENCY {
            return Err(EdgeError::Config(format!(
                "eviction.concurrency must be between 1 and {}, got {}",
                MAX_EVICTION_CONCURRENCY, self.eviction.concurrency
            )));
        }

        if let Some(ref endpoint) = self.metrics_endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    EdgeError::Config(format!(
                        "Invalid metrics_endpoint address '{}': {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Address the main listener binds to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                EdgeError::Config(format!(
                    "Invalid listen address {}:{}: {}",
                    self.server.host, self.server.port, e
                ))
            })
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache.max_age_secs)
    }

    pub fn log_ttl(&self) -> Duration {
        Duration::from_secs(self.log.ttl_secs)
    }
}
