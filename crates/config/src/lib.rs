//! Configuration for the Concord clustered reverse proxy.
//!
//! The static configuration is a TOML document. Only the `[[location]]`
//! entries are replicated: at bootstrap each one is proposed to the cluster as
//! a create-pool log entry, and the same [`Location`] shape is the payload of
//! that entry on the wire. Everything else is node-local.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

pub mod location;
pub mod validate;

pub use location::{backend_address, parse_backend, Location};
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(ValidationResult),
}

// ============================================================================
// Sections
// ============================================================================

/// Node identity and local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name, used in logs and snapshot metadata.
    pub name: String,
    /// Directory for persisted snapshots. Snapshots stay in memory when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "concord".to_string(),
            data_dir: None,
        }
    }
}

/// Process logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Consensus-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Propose the static locations when the node starts without a snapshot.
    pub bootstrap: bool,
    /// Upper bound a writer waits for its proposal to commit.
    pub propose_timeout_ms: u64,
    /// Committed entries between automatic snapshots.
    pub snapshot_threshold: u64,
}

impl ClusterConfig {
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: true,
            propose_timeout_ms: 5_000,
            snapshot_threshold: 1_024,
        }
    }
}

/// Active backend health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long a host removal waits for the host's check loop to stop.
    pub host_shutdown_timeout_ms: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn host_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.host_shutdown_timeout_ms)
    }

    /// Health checking switched off, used by tests and single-host setups.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            connect_timeout_ms: 2_000,
            host_shutdown_timeout_ms: 5_000,
        }
    }
}

/// Balancer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceConfig {
    /// Virtual ring points per host for consistent hashing.
    pub replicas: usize,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        Self { replicas: 50 }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub log: LogConfig,
    pub cluster: ClusterConfig,
    pub health_check: HealthCheckConfig,
    pub load_balance: LoadBalanceConfig,
    #[serde(rename = "location")]
    pub locations: Vec<Location>,
}

impl Config {
    /// Load and parse a TOML configuration file.
    ///
    /// The result is not validated; call [`Config::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        trace!(path = ?path, "Reading configuration file");
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(
            path = ?path,
            locations = config.locations.len(),
            "Loaded configuration file"
        );
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Schema validation plus lint.
    ///
    /// Returns the full result (warnings included) when there are no errors.
    pub fn validate(&self) -> Result<ValidationResult, ConfigError> {
        let mut result = validate::validate_schema(self);
        result.merge(validate::lint::lint_config(self));
        if result.has_errors() {
            return Err(ConfigError::Invalid(result));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[node]
name = "node-1"

[cluster]
propose_timeout_ms = 2500

[health_check]
interval_ms = 1000

[[location]]
pattern = "/api"
proxy_pass = ["http://127.0.0.1:8000", "http://127.0.0.1:8001"]
balance_mode = "round-robin"

[[location]]
pattern = "/static"
proxy_pass = ["http://127.0.0.1:9000"]
balance_mode = "consistent-hash"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.node.name, "node-1");
        assert_eq!(config.cluster.propose_timeout(), Duration::from_millis(2500));
        assert!(config.cluster.bootstrap);
        assert_eq!(config.health_check.interval(), Duration::from_secs(1));
        assert_eq!(config.health_check.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.load_balance.replicas, 50);
        assert_eq!(config.locations.len(), 2);
        assert_eq!(config.locations[1].balance_mode, "consistent-hash");
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.node.name, "concord");
        assert_eq!(config.log.level, "info");
        assert!(config.locations.is_empty());
        assert!(config.health_check.enabled);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.locations[0].pattern, "/api");
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file("/nonexistent/concord.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let text = r#"
[[location]]
pattern = "api"
proxy_pass = ["http://127.0.0.1:8000"]
balance_mode = "round-robin"
"#;
        let config = Config::from_toml_str(text).unwrap();
        match config.validate() {
            Err(ConfigError::Invalid(result)) => {
                assert!(result.errors.iter().any(|e| e.message.contains("must begin with '/'")));
            }
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_sample_passes() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let result = config.validate().unwrap();
        assert!(!result.has_errors());
    }
}
