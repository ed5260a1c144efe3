//! Host selection policies.
//!
//! A pool owns one [`Balancer`] built by name from a [`BalancerRegistry`].
//! The balancer only ever sees hosts that are currently alive: the health
//! checker adds and removes hosts as they change state.

mod consistent_hash;
mod round_robin;

pub use consistent_hash::ConsistentHash;
pub use round_robin::RoundRobin;

use std::collections::BTreeMap;
use std::sync::Arc;

use concord_common::{Classify, ErrorKind};
use thiserror::Error;

pub const ROUND_ROBIN: &str = "round-robin";
pub const CONSISTENT_HASH: &str = "consistent-hash";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no host available")]
    NoHost,

    #[error("balance mode '{0}' is not supported")]
    UnsupportedAlgorithm(String),
}

impl Classify for BalancerError {
    fn kind(&self) -> ErrorKind {
        match self {
            BalancerError::NoHost => ErrorKind::NotFound,
            BalancerError::UnsupportedAlgorithm(_) => ErrorKind::Validation,
        }
    }
}

/// Host selection over a pool's alive hosts.
pub trait Balancer: Send + Sync {
    /// Add a host. Adding a known host is a no-op.
    fn add(&self, host: &str);

    fn remove(&self, host: &str);

    /// Pick a host for a request identified by `key`.
    fn balance(&self, key: &str) -> Result<String, BalancerError>;

    /// A request was sent to `host`.
    fn inc(&self, _host: &str) {}

    /// A request to `host` completed.
    fn done(&self, _host: &str) {}

    /// Distinct hosts currently selectable.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registry name this balancer was built under.
    fn mode(&self) -> &'static str;
}

/// Tuning shared by every balancer a registry builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancerSettings {
    /// Virtual ring points per host for consistent hashing.
    pub replicas: usize,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self { replicas: 50 }
    }
}

pub type BalancerFactory = fn(&[String], &BalancerSettings) -> Arc<dyn Balancer>;

/// Name to constructor map.
#[derive(Clone)]
pub struct BalancerRegistry {
    factories: BTreeMap<String, BalancerFactory>,
    settings: BalancerSettings,
}

impl BalancerRegistry {
    pub fn empty(settings: BalancerSettings) -> Self {
        Self {
            factories: BTreeMap::new(),
            settings,
        }
    }

    /// Registry with `round-robin` and `consistent-hash`.
    pub fn with_defaults(settings: BalancerSettings) -> Self {
        let mut registry = Self::empty(settings);
        registry.register(ROUND_ROBIN, |hosts, _| Arc::new(RoundRobin::new(hosts)));
        registry.register(CONSISTENT_HASH, |hosts, settings| {
            Arc::new(ConsistentHash::new(hosts, settings.replicas))
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: BalancerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, name: &str, hosts: &[String]) -> Result<Arc<dyn Balancer>, BalancerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BalancerError::UnsupportedAlgorithm(name.to_string()))?;
        Ok(factory(hosts, &self.settings))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn settings(&self) -> BalancerSettings {
        self.settings
    }
}

impl std::fmt::Debug for BalancerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancerRegistry")
            .field("names", &self.names())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds_known_modes() {
        let registry = BalancerRegistry::with_defaults(BalancerSettings::default());
        let hosts = vec!["a:1".to_string(), "b:1".to_string()];

        let rr = registry.build(ROUND_ROBIN, &hosts).unwrap();
        assert_eq!(rr.mode(), ROUND_ROBIN);
        assert_eq!(rr.len(), 2);

        let ch = registry.build(CONSISTENT_HASH, &hosts).unwrap();
        assert_eq!(ch.mode(), CONSISTENT_HASH);
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn test_registry_rejects_unknown_mode() {
        let registry = BalancerRegistry::with_defaults(BalancerSettings::default());
        let err = registry.build("random", &[]).err().unwrap();
        assert_eq!(err, BalancerError::UnsupportedAlgorithm("random".into()));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_registry_names_sorted() {
        let registry = BalancerRegistry::with_defaults(BalancerSettings::default());
        assert_eq!(registry.names(), vec![CONSISTENT_HASH.to_string(), ROUND_ROBIN.to_string()]);
    }
}
