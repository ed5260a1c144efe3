use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{Balancer, BalancerError, ROUND_ROBIN};

/// Fixed rotation over hosts in insertion order. The request key is ignored.
pub struct RoundRobin {
    hosts: RwLock<Vec<String>>,
    next: AtomicU64,
}

impl RoundRobin {
    pub fn new(hosts: &[String]) -> Self {
        let balancer = Self {
            hosts: RwLock::new(Vec::with_capacity(hosts.len())),
            next: AtomicU64::new(0),
        };
        for host in hosts {
            balancer.add(host);
        }
        balancer
    }
}

impl Balancer for RoundRobin {
    fn add(&self, host: &str) {
        let mut hosts = self.hosts.write();
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }

    fn remove(&self, host: &str) {
        self.hosts.write().retain(|h| h != host);
    }

    fn balance(&self, _key: &str) -> Result<String, BalancerError> {
        let hosts = self.hosts.read();
        if hosts.is_empty() {
            return Err(BalancerError::NoHost);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len() as u64;
        Ok(hosts[idx as usize].clone())
    }

    fn len(&self) -> usize {
        self.hosts.read().len()
    }

    fn mode(&self) -> &'static str {
        ROUND_ROBIN
    }
}
