//! Configuration lint.
//!
//! Flags setups that are valid but likely to hurt in production.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.locations.is_empty() && config.cluster.bootstrap {
        result.add_warning(ValidationWarning::new(
            "bootstrap is enabled but no locations are configured",
        ));
    }

    for location in &config.locations {
        if location.proxy_pass.len() == 1 && !config.health_check.enabled {
            result.add_warning(ValidationWarning::new(format!(
                "Location '{}' has only one backend and health checks are disabled (no failover possible)",
                location.pattern
            )));
        }

        if location.pattern == "/" && config.locations.len() > 1 {
            result.add_warning(ValidationWarning::new(
                "Location '/' catches every path not claimed by a longer prefix",
            ));
        }
    }

    if config.node.data_dir.is_none() {
        result.add_warning(ValidationWarning::new(
            "node.data_dir is unset, snapshots will not survive a restart",
        ));
    }

    if config.health_check.enabled
        && config.health_check.connect_timeout_ms >= config.health_check.interval_ms
    {
        result.add_warning(ValidationWarning::new(format!(
            "health check connect timeout ({}ms) is not shorter than the interval ({}ms)",
            config.health_check.connect_timeout_ms, config.health_check.interval_ms
        )));
    }

    result
}
