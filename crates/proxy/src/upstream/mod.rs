//! Backend pools: hosts, liveness, balancer and per-path limiters of one
//! routed prefix.

mod health;
mod pool;

pub use health::{HealthCheck, HealthProbe, TcpProbe};
pub use pool::{BackendPool, DispatchGuard, HostStatus, PoolInfo};

use std::net::IpAddr;

use concord_common::{Classify, ErrorKind};
use thiserror::Error;

use crate::balancer::BalancerError;
use crate::limiter::LimiterError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    #[error("host '{host}' is not part of pool '{pattern}'")]
    HostNotFound { pattern: String, host: String },

    #[error("health check for host '{0}' did not stop in time")]
    ShutdownTimeout(String),

    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::InvalidBackend(_) => ErrorKind::Validation,
            UpstreamError::HostNotFound { .. } => ErrorKind::NotFound,
            UpstreamError::ShutdownTimeout(_) => ErrorKind::Internal,
            UpstreamError::Balancer(e) => e.kind(),
        }
    }
}

/// Why a request could not be handed to a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("client {0} is denied by the access control list")]
    Denied(IpAddr),

    #[error("no route for path '{0}'")]
    NoRoute(String),

    #[error("rate limit exceeded for '{pattern}{path}'")]
    Throttled { pattern: String, path: String },

    #[error("no alive host in pool '{0}'")]
    NoHost(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

impl Classify for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Denied(_) => ErrorKind::Validation,
            DispatchError::NoRoute(_) | DispatchError::NoHost(_) => ErrorKind::NotFound,
            DispatchError::Throttled { .. } => ErrorKind::Capacity,
            DispatchError::ShuttingDown => ErrorKind::Internal,
            DispatchError::Limiter(e) => e.kind(),
        }
    }
}

impl DispatchError {
    /// Metrics label for this outcome.
    pub fn outcome(&self) -> &'static str {
        use crate::metrics::outcome;
        match self {
            DispatchError::Denied(_) => outcome::DENIED,
            DispatchError::NoRoute(_) => outcome::NOT_FOUND,
            DispatchError::Throttled { .. } | DispatchError::Limiter(_) => outcome::THROTTLED,
            DispatchError::NoHost(_) => outcome::NO_HOST,
            DispatchError::ShuttingDown => outcome::SHUTTING_DOWN,
        }
    }

    /// Status a front end answers with. Denied clients get 403.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::Denied(_) => 403,
            DispatchError::NoHost(_) => 502,
            DispatchError::ShuttingDown => 503,
            other => other.kind().http_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_status() {
        let denied = DispatchError::Denied("10.0.0.1".parse().unwrap());
        assert_eq!(denied.http_status(), 403);
        assert_eq!(denied.outcome(), "denied");

        let throttled = DispatchError::Throttled {
            pattern: "/api".into(),
            path: "/users".into(),
        };
        assert_eq!(throttled.kind(), ErrorKind::Capacity);
        assert_eq!(throttled.http_status(), 429);

        assert_eq!(DispatchError::NoRoute("/x".into()).http_status(), 404);
        assert_eq!(DispatchError::NoHost("/api".into()).http_status(), 502);
    }
}
