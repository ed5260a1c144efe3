//! Routing table: every backend pool keyed by path prefix, plus the
//! replicated configuration each pool was built from.

mod router;
mod table;

pub use router::{PrefixRouter, RouteMatch, DEFAULT_ROUTER};
pub use table::{LimiterStatus, RoutingSnapshot, RoutingTable};

pub use crate::upstream::DispatchError;

use concord_common::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balancer::BalancerError;
use crate::limiter::LimiterError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("{0}")]
    InvalidPattern(String),

    #[error("no pool registered for pattern '{0}'")]
    PoolNotFound(String),

    #[error("no limiter installed for '{pattern}{path}'")]
    LimiterNotFound { pattern: String, path: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

impl Classify for RoutingError {
    fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::InvalidPattern(_) => ErrorKind::Validation,
            RoutingError::PoolNotFound(_) | RoutingError::LimiterNotFound { .. } => {
                ErrorKind::NotFound
            }
            RoutingError::Upstream(e) => e.kind(),
            RoutingError::Limiter(e) => e.kind(),
            RoutingError::Balancer(e) => e.kind(),
        }
    }
}

/// Replicated limiter configuration for one sub-path of a pool.
///
/// `speed` and `volume` are passed to the limiter's `set_rate`; `duration`
/// is the dispatch wait in milliseconds (zero means do not wait).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterInfo {
    pub prefix: String,
    pub path_name: String,
    pub limiter_type: String,
    #[serde(default, alias = "volumn")]
    pub volume: i64,
    #[serde(default)]
    pub speed: i64,
    #[serde(default)]
    pub duration: u64,
}

impl LimiterInfo {
    pub fn new(
        prefix: impl Into<String>,
        path_name: impl Into<String>,
        limiter_type: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            path_name: path_name.into(),
            limiter_type: limiter_type.into(),
            volume: 0,
            speed: 0,
            duration: 0,
        }
    }

    pub fn with_rate(mut self, volume: i64, speed: i64) -> Self {
        self.volume = volume;
        self.speed = speed;
        self
    }

    pub fn with_duration_ms(mut self, duration: u64) -> Self {
        self.duration = duration;
        self
    }
}
