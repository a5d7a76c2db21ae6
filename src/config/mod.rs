/// Configuration management for enlace
///
/// A `DriverConfig` is read from TOML and turned into the cluster options and
/// session options the driver runs with.
use crate::cluster::{ClusterOptions, ReadBalancing, RefreshPolicy, StalePrimaryPolicy};
use crate::core::PoolOptions;
use crate::options::{Consistency, Options, CONSISTENCY, DATABASE, SAFE};
use crate::utils::validate_address;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Main enlace configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DriverConfig {
    /// Seeds and timeouts
    pub cluster: ClusterConfig,
    /// Per-node socket pool
    pub pool: PoolConfig,
    /// Topology discovery cadence
    pub refresh: RefreshConfig,
    /// Default session options
    pub options: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// `host:port` addresses to start discovery from
    pub seeds: Vec<String>,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    /// TCP keepalive idle time; 0 disables keepalive
    pub keepalive_sec: u64,
    /// "surface" or "retry"
    pub stale_primary: String,
    /// "round-robin" or "least-in-use"
    pub read_balancing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum sockets per node
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between discovery passes; 0 refreshes only on demand
    pub interval_sec: u64,
    /// Discover when no node can serve an operation
    pub on_routing_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub database: Option<String>,
    /// Wait for `getlasterror` after writes
    pub safe: bool,
    /// "strong" or "eventual"
    pub consistency: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["127.0.0.1:27017".to_string()],
            connect_timeout_ms: 5_000,
            operation_timeout_ms: 30_000,
            keepalive_sec: 120,
            stale_primary: "surface".to_string(),
            read_balancing: "round-robin".to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: PoolOptions::default().pool_size,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_sec: 300,
            on_routing_failure: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: DriverConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster.seeds cannot be empty".to_string(),
            ));
        }

        for seed in &self.cluster.seeds {
            validate_address(seed).map_err(ConfigError::ValidationError)?;
        }

        if self.cluster.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.cluster.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        self.stale_primary()?;
        self.read_balancing()?;

        if self.pool.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if let Some(consistency) = &self.options.consistency {
            consistency
                .parse::<Consistency>()
                .map_err(ConfigError::ValidationError)?;
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        EnvFilter::try_new(&self.logging.level).map_err(|_| {
            ConfigError::ValidationError(format!("Invalid log level: {}", self.logging.level))
        })?;

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        match self.cluster.keepalive_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn stale_primary(&self) -> Result<StalePrimaryPolicy, ConfigError> {
        self.cluster
            .stale_primary
            .parse()
            .map_err(ConfigError::ValidationError)
    }

    fn read_balancing(&self) -> Result<ReadBalancing, ConfigError> {
        self.cluster
            .read_balancing
            .parse()
            .map_err(ConfigError::ValidationError)
    }

    /// Cluster options described by the `[cluster]`, `[pool]` and
    /// `[refresh]` sections
    pub fn to_cluster_options(&self) -> Result<ClusterOptions, ConfigError> {
        Ok(ClusterOptions {
            pool: PoolOptions {
                pool_size: self.pool.pool_size,
                operation_timeout: Duration::from_millis(self.cluster.operation_timeout_ms),
            },
            refresh: RefreshPolicy {
                interval: match self.refresh.interval_sec {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                on_routing_failure: self.refresh.on_routing_failure,
            },
            stale_primary: self.stale_primary()?,
            read_balancing: self.read_balancing()?,
        })
    }

    /// Session options described by the `[options]` section
    pub fn to_options(&self) -> Options {
        let mut options = Options::new();
        if let Some(database) = &self.options.database {
            options.insert(DATABASE, database.as_str());
        }
        if self.options.safe {
            options.insert(SAFE, true);
        }
        if let Some(consistency) = &self.options.consistency {
            options.insert(CONSISTENCY, consistency.as_str());
        }
        options
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, topology: &str) -> Result<(), ConfigError> {
        let config = match topology {
            "standalone" => DriverConfig::default(),
            "replica-set" => DriverConfig {
                cluster: ClusterConfig {
                    seeds: vec![
                        "10.0.1.10:27017".to_string(),
                        "10.0.1.11:27017".to_string(),
                        "10.0.1.12:27017".to_string(),
                    ],
                    ..Default::default()
                },
                options: SessionConfig {
                    database: Some("app".to_string()),
                    safe: true,
                    consistency: Some("eventual".to_string()),
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Topology must be 'standalone' or 'replica-set'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Install a global `tracing` subscriber for `config`. `RUST_LOG` overrides
/// the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::ValidationError(format!("Invalid log level: {}", e)))?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "compact" => fmt::layer().compact().boxed(),
        _ => fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| ConfigError::LoggingError(e.to_string()))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Logging error: {0}")]
    LoggingError(String),
}
