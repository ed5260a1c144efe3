//! Per-path request throttles.
//!
//! Every pool keeps one limiter per sub-path. Limiters are built by name from a
//! [`LimiterRegistry`] so the limiter kind can travel inside replicated log
//! entries as a plain string.

mod concurrency;
mod qps;

pub use concurrency::ConcurrencyLimiter;
pub use qps::QpsLimiter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_common::{Classify, ErrorKind};
use thiserror::Error;

pub const QPS: &str = "qps";
pub const CONCURRENCY: &str = "concurrency";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("the token has been used up")]
    NoToken,

    #[error("limiter type '{0}' is not supported")]
    UnsupportedType(String),

    #[error("a limiter is already installed for '{0}'")]
    AlreadyExists(String),
}

impl Classify for LimiterError {
    fn kind(&self) -> ErrorKind {
        match self {
            LimiterError::NoToken => ErrorKind::Capacity,
            LimiterError::UnsupportedType(_) => ErrorKind::Validation,
            LimiterError::AlreadyExists(_) => ErrorKind::Internal,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take a permit without waiting.
    fn take(&self) -> Result<(), LimiterError>;

    /// Take a permit, waiting at most `timeout`.
    async fn take_with_timeout(&self, timeout: Duration) -> Result<(), LimiterError>;

    /// Reconfigure capacity. Meaning of `speed` is limiter specific.
    fn set_rate(&self, volume: i64, speed: i64);

    fn volume(&self) -> i64;

    fn speed(&self) -> i64;

    /// How long dispatch waits for a permit. Zero means do not wait.
    fn timeout(&self) -> Duration;

    fn set_timeout(&self, timeout: Duration);

    /// Return a permit taken by a finished request.
    fn release(&self) {}

    /// Registry name this limiter was built under.
    fn kind(&self) -> &'static str;
}

pub type LimiterFactory = fn() -> Arc<dyn RateLimiter>;

/// Name to constructor map.
#[derive(Clone)]
pub struct LimiterRegistry {
    factories: BTreeMap<String, LimiterFactory>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LimiterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `qps` and `concurrency`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(QPS, || Arc::new(QpsLimiter::new()));
        registry.register(CONCURRENCY, || Arc::new(ConcurrencyLimiter::new()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: LimiterFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, name: &str) -> Result<Arc<dyn RateLimiter>, LimiterError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| LimiterError::UnsupportedType(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("names", &self.names())
            .finish()
    }
}
