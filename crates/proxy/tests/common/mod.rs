//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use concord_config::Location;
use concord_proxy::balancer::{BalancerRegistry, BalancerSettings, ROUND_ROBIN};
use concord_proxy::cluster::{LocalConsensus, ProxyStateMachine};
use concord_proxy::limiter::LimiterRegistry;
use concord_proxy::{AccessControlList, ControlPlane, ProxyMetrics, RoutingTable};

/// A fresh state machine with no health checks.
pub fn machine() -> Arc<ProxyStateMachine> {
    let table = RoutingTable::new(
        Arc::new(AccessControlList::new()),
        BalancerRegistry::with_defaults(BalancerSettings::default()),
        LimiterRegistry::with_defaults(),
        Arc::new(ProxyMetrics::new().unwrap()),
    );
    Arc::new(ProxyStateMachine::new(Arc::new(table)))
}

/// One primary plus `replicas` followers fed by the same loopback log.
pub struct TestCluster {
    pub primary: Arc<ProxyStateMachine>,
    pub replicas: Vec<Arc<ProxyStateMachine>>,
    pub consensus: LocalConsensus,
    pub control: ControlPlane,
}

impl TestCluster {
    pub fn new(replicas: usize) -> Self {
        let primary = machine();
        let replicas: Vec<_> = (0..replicas).map(|_| machine()).collect();

        let mut builder = LocalConsensus::builder(primary.clone());
        for replica in &replicas {
            builder = builder.replica(replica.clone());
        }
        let consensus = builder.build();
        let control = ControlPlane::new(Arc::new(consensus.clone()), primary.clone());

        Self {
            primary,
            replicas,
            consensus,
            control,
        }
    }

    pub fn machines(&self) -> impl Iterator<Item = &Arc<ProxyStateMachine>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

pub fn location(pattern: &str, hosts: &[&str]) -> Location {
    Location::new(
        pattern,
        hosts.iter().map(|h| h.to_string()).collect(),
        ROUND_ROBIN,
    )
}
