use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use super::{Balancer, BalancerError, CONSISTENT_HASH};

#[derive(Default)]
struct Ring {
    points: Vec<u64>,
    owners: HashMap<u64, String>,
    hosts: BTreeSet<String>,
}

/// Hash ring with `replicas` virtual points per host.
///
/// Point `i` of a host is `xxh3(i ++ host)`. A key goes to the first point at
/// or after its own hash, wrapping to the start of the ring.
pub struct ConsistentHash {
    replicas: usize,
    ring: RwLock<Ring>,
}

impl ConsistentHash {
    pub fn new(hosts: &[String], replicas: usize) -> Self {
        let balancer = Self {
            replicas: replicas.max(1),
            ring: RwLock::new(Ring::default()),
        };
        for host in hosts {
            balancer.add(host);
        }
        balancer
    }

    fn point(i: usize, host: &str) -> u64 {
        xxh3_64(format!("{}{}", i, host).as_bytes())
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

impl Balancer for ConsistentHash {
    fn add(&self, host: &str) {
        let mut ring = self.ring.write();
        if !ring.hosts.insert(host.to_string()) {
            return;
        }
        for i in 0..self.replicas {
            let point = Self::point(i, host);
            if ring.owners.insert(point, host.to_string()).is_none() {
                ring.points.push(point);
            }
        }
        ring.points.sort_unstable();
    }

    fn remove(&self, host: &str) {
        let mut ring = self.ring.write();
        if !ring.hosts.remove(host) {
            return;
        }
        let Ring { points, owners, .. } = &mut *ring;
        points.retain(|point| {
            let owned = owners.get(point).is_some_and(|owner| owner == host);
            if owned {
                owners.remove(point);
            }
            !owned
        });
    }

    fn balance(&self, key: &str) -> Result<String, BalancerError> {
        let ring = self.ring.read();
        if ring.points.is_empty() {
            return Err(BalancerError::NoHost);
        }
        let hash = xxh3_64(key.as_bytes());
        let idx = ring.points.partition_point(|&p| p < hash) % ring.points.len();
        ring.owners
            .get(&ring.points[idx])
            .cloned()
            .ok_or(BalancerError::NoHost)
    }

    fn len(&self) -> usize {
        self.ring.read().hosts.len()
    }

    fn mode(&self) -> &'static str {
        CONSISTENT_HASH
    }
}
