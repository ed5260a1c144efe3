//! Configuration validation.
//!
//! Validation runs in layers:
//! - schema checks ([`validate_schema`]), always run before a node starts
//! - lint ([`lint::lint_config`]), warnings only
//! - backend reachability ([`network::validate_backends`]), run by `concord test --network`

use std::collections::HashSet;
use std::fmt;

use crate::location::check_pattern;
use crate::Config;

pub mod lint;
pub mod network;

// ============================================================================
// Result types
// ============================================================================

/// What part of the configuration an error concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Location,
    Backend,
    Cluster,
    HealthCheck,
    LoadBalance,
    Network,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Location => "location",
            ErrorCategory::Backend => "backend",
            ErrorCategory::Cluster => "cluster",
            ErrorCategory::HealthCheck => "health_check",
            ErrorCategory::LoadBalance => "load_balance",
            ErrorCategory::Network => "network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated errors and warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        if messages.is_empty() {
            write!(f, "{} warning(s)", self.warnings.len())
        } else {
            f.write_str(&messages.join("; "))
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Structural validation of a parsed configuration.
pub fn validate_schema(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = HashSet::new();

    for location in &config.locations {
        if let Err(message) = check_pattern(&location.pattern) {
            result.add_error(ValidationError::new(ErrorCategory::Location, message));
        }

        if !seen.insert(location.pattern.as_str()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Location,
                format!("duplicate location pattern '{}'", location.pattern),
            ));
        }

        if location.proxy_pass.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Location,
                format!("location '{}' has no proxy hosts", location.pattern),
            ));
        }

        for backend in &location.proxy_pass {
            if let Err(message) = crate::parse_backend(backend) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Backend,
                    format!("location '{}': {}", location.pattern, message),
                ));
            }
        }

        if location.balance_mode.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Location,
                format!("location '{}' has no balance mode", location.pattern),
            ));
        }
    }

    if config.cluster.propose_timeout_ms == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Cluster,
            "propose_timeout_ms must be greater than zero",
        ));
    }

    if config.health_check.enabled {
        if config.health_check.interval_ms == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::HealthCheck,
                "interval_ms must be greater than zero",
            ));
        }
        if config.health_check.connect_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::HealthCheck,
                "connect_timeout_ms must be greater than zero",
            ));
        }
    }

    if config.load_balance.replicas == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::LoadBalance,
            "replicas must be at least 1",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;

    fn location(pattern: &str, hosts: &[&str]) -> Location {
        Location::new(
            pattern,
            hosts.iter().map(|h| h.to_string()).collect(),
            "round-robin",
        )
    }

    #[test]
    fn test_duplicate_patterns() {
        let config = Config {
            locations: vec![
                location("/api", &["http://127.0.0.1:1"]),
                location("/api", &["http://127.0.0.1:2"]),
            ],
            ..Default::default()
        };
        let result = validate_schema(&config);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("duplicate"));
    }

    #[test]
    fn test_empty_proxy_pass_and_bad_backend() {
        let config = Config {
            locations: vec![
                location("/a", &[]),
                location("/b", &["tcp://127.0.0.1:1"]),
            ],
            ..Default::default()
        };
        let result = validate_schema(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Location && e.message.contains("no proxy hosts")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Backend));
    }

    #[test]
    fn test_zero_replicas() {
        let mut config = Config::default();
        config.load_balance.replicas = 0;
        let result = validate_schema(&config);
        assert!(result.has_errors());
        assert_eq!(result.errors[0].category, ErrorCategory::LoadBalance);
    }

    #[test]
    fn test_zero_interval_only_matters_when_enabled() {
        let mut config = Config::default();
        config.health_check.interval_ms = 0;
        assert!(validate_schema(&config).has_errors());

        config.health_check.enabled = false;
        assert!(!validate_schema(&config).has_errors());
    }

    #[test]
    fn test_display_joins_errors() {
        let mut result = ValidationResult::new();
        result.add_error(ValidationError::new(ErrorCategory::Cluster, "one"));
        result.add_error(ValidationError::new(ErrorCategory::Location, "two"));
        assert_eq!(result.to_string(), "[cluster] one; [location] two");
    }
}
