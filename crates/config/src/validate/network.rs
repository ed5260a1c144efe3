//! Backend reachability.
//!
//! Dials every configured backend once, the same probe the health checker uses.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{backend_address, parse_backend, Config};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub async fn validate_backends(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let connect_timeout = config.health_check.connect_timeout();

    for location in &config.locations {
        for backend in &location.proxy_pass {
            // Unparsable backends are reported by the schema pass
            let Some(address) = parse_backend(backend).ok().and_then(|u| backend_address(&u))
            else {
                continue;
            };

            match timeout(connect_timeout, TcpStream::connect(&address)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Network,
                        format!(
                            "Location '{}' backend '{}' unreachable: {}",
                            location.pattern, address, e
                        ),
                    ));
                }
                Err(_) => {
                    result.add_warning(ValidationWarning::new(format!(
                        "Location '{}' backend '{}' connection timeout ({}ms)",
                        location.pattern,
                        address,
                        connect_timeout.as_millis()
                    )));
                }
            }
        }
    }

    result
}
