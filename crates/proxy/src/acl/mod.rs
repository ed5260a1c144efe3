//! IP blacklist backed by a CIDR trie.
//!
//! Rules are IPv4 CIDR blocks. A client matches when any registered block
//! contains its address; the most specific block's tag is reported.

mod trie;

pub use trie::CidrTrie;

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use concord_common::{Classify, ErrorKind};
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AclError {
    #[error("invalid ip address '{0}', expected a.b.c.d/len")]
    InvalidAddress(String),

    #[error("invalid net mask in '{0}', must be in [0, 32]")]
    InvalidMask(String),

    #[error("no rule registered for '{0}'")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Classify for AclError {
    fn kind(&self) -> ErrorKind {
        match self {
            AclError::InvalidAddress(_) | AclError::InvalidMask(_) | AclError::InvalidInput(_) => {
                ErrorKind::Validation
            }
            AclError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Parse `a.b.c.d/len` into its canonical network.
///
/// Host bits are cleared, so `10.0.0.7/24` becomes `10.0.0.0/24`.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, AclError> {
    let (addr, len) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| AclError::InvalidAddress(cidr.to_string()))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| AclError::InvalidAddress(cidr.to_string()))?;
    let len: u8 = len
        .parse()
        .map_err(|_| AclError::InvalidMask(cidr.to_string()))?;
    let net = Ipv4Net::new(addr, len).map_err(|_| AclError::InvalidMask(cidr.to_string()))?;
    Ok(net.trunc())
}

fn key_and_mask(net: &Ipv4Net) -> (u32, u32) {
    (u32::from(net.network()), u32::from(net.netmask()))
}

/// A complete rule set built off to the side, ready to be installed.
pub struct AclRules {
    trie: CidrTrie,
    records: BTreeSet<String>,
}

impl AclRules {
    /// Build a rule set from canonical records, each tagged with itself.
    pub fn build(records: &[String]) -> Result<Self, AclError> {
        let mut rules = Self {
            trie: CidrTrie::new(),
            records: BTreeSet::new(),
        };
        for record in records {
            let net = parse_cidr(record)?;
            let (key, mask) = key_and_mask(&net);
            rules.trie.insert(key, mask, net.to_string());
            rules.records.insert(net.to_string());
        }
        Ok(rules)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Debug for AclRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclRules")
            .field("records", &self.records)
            .finish()
    }
}

/// Thread-safe blacklist: the trie plus the set of registered CIDR strings.
///
/// The record set is what snapshots carry; the trie is rebuilt from it.
pub struct AccessControlList {
    inner: RwLock<AclRules>,
}

impl Default for AccessControlList {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessControlList {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AclRules {
                trie: CidrTrie::new(),
                records: BTreeSet::new(),
            }),
        }
    }

    /// Build a list from snapshot records, each tagged with its canonical
    /// network.
    pub fn from_records<I, S>(records: I) -> Result<Self, AclError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let acl = Self::new();
        for record in records {
            acl.block(record.as_ref())?;
        }
        Ok(acl)
    }

    /// Register a block tagged with its canonical network, the same tag a
    /// snapshot restore gives it.
    pub fn block(&self, cidr: &str) -> Result<(), AclError> {
        let net = parse_cidr(cidr)?;
        self.add(cidr, &net.to_string())
    }

    /// Register a block. Re-adding an existing block replaces its tag.
    ///
    /// An empty tag is what a miss looks like, so it is refused.
    pub fn add(&self, cidr: &str, tag: &str) -> Result<(), AclError> {
        if tag.is_empty() {
            return Err(AclError::InvalidInput(format!("empty tag for '{}'", cidr)));
        }
        let net = parse_cidr(cidr)?;
        let (key, mask) = key_and_mask(&net);

        let mut inner = self.inner.write();
        inner.trie.insert(key, mask, tag.to_string());
        inner.records.insert(net.to_string());

        debug!(cidr = %net, rules = inner.records.len(), "ACL rule added");
        Ok(())
    }

    pub fn delete(&self, cidr: &str) -> Result<(), AclError> {
        let net = parse_cidr(cidr)?;
        let (key, mask) = key_and_mask(&net);

        let mut inner = self.inner.write();
        if !inner.trie.remove(key, mask) {
            debug!(cidr = %net, "ACL rule not found");
            return Err(AclError::NotFound(cidr.to_string()));
        }
        inner.records.remove(&net.to_string());

        debug!(cidr = %net, rules = inner.records.len(), "ACL rule deleted");
        Ok(())
    }

    /// Tag of the most specific block containing `ip`.
    ///
    /// Accepts a bare address or `address:port`.
    pub fn search(&self, ip: &str) -> Result<Option<String>, AclError> {
        let host = ip.split(':').next().unwrap_or(ip);
        let addr: Ipv4Addr = host
            .parse()
            .map_err(|_| AclError::InvalidAddress(ip.to_string()))?;
        Ok(self.lookup(addr))
    }

    fn lookup(&self, addr: Ipv4Addr) -> Option<String> {
        self.inner
            .read()
            .trie
            .search(u32::from(addr))
            .map(str::to_string)
    }

    /// Whether `ip` falls inside a blacklisted block. IPv6 clients never match.
    pub fn is_denied(&self, ip: IpAddr) -> bool {
        let denied = match ip {
            IpAddr::V4(addr) => self.lookup(addr).is_some(),
            IpAddr::V6(addr) => match addr.to_ipv4_mapped() {
                Some(mapped) => self.lookup(mapped).is_some(),
                None => false,
            },
        };
        if denied {
            trace!(client = %ip, "Client denied by ACL");
        }
        denied
    }

    /// Registered blocks in canonical form, sorted.
    pub fn list_all(&self) -> Vec<String> {
        self.inner.read().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().trie.node_count()
    }

    /// Drop every rule.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.trie = CidrTrie::new();
        inner.records.clear();
    }

    /// Replace every rule with `records` in one step.
    pub fn replace_with(&self, records: &[String]) -> Result<(), AclError> {
        self.install(AclRules::build(records)?);
        Ok(())
    }

    /// Swap in a prepared rule set. Returns the rules it replaced.
    pub fn install(&self, rules: AclRules) -> AclRules {
        let previous = std::mem::replace(&mut *self.inner.write(), rules);
        debug!(
            rules = self.len(),
            previous = previous.len(),
            "ACL rules installed"
        );
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_enforcement() {
        let acl = AccessControlList::new();
        acl.add("10.0.0.0/24", "10.0.0.0/24").unwrap();

        assert!(acl.search("10.0.0.5").unwrap().is_some());
        assert!(acl.search("10.0.1.5").unwrap().is_none());
        assert!(acl.is_denied("10.0.0.200".parse().unwrap()));
        assert!(!acl.is_denied("10.0.1.1".parse().unwrap()));
    }

    #[test]
    fn test_search_strips_port() {
        let acl = AccessControlList::new();
        acl.add("192.168.1.1/32", "blocked").unwrap();
        assert_eq!(acl.search("192.168.1.1:54321").unwrap().as_deref(), Some("blocked"));
    }

    #[test]
    fn test_empty_tag_rejected() {
        let acl = AccessControlList::new();
        let err = acl.add("10.0.0.0/24", "").unwrap_err();
        assert!(matches!(err, AclError::InvalidInput(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(acl.is_empty());
        assert_eq!(acl.search("10.0.0.1").unwrap(), None);
    }

    #[test]
    fn test_block_uses_canonical_tag() {
        let acl = AccessControlList::new();
        acl.block("10.0.0.7/24").unwrap();
        assert_eq!(acl.search("10.0.0.9").unwrap().as_deref(), Some("10.0.0.0/24"));

        let restored = AccessControlList::new();
        restored.replace_with(&acl.list_all()).unwrap();
        assert_eq!(restored.search("10.0.0.9").unwrap(), acl.search("10.0.0.9").unwrap());
    }

    #[test]
    fn test_install_swaps_rules() {
        let acl = AccessControlList::new();
        acl.block("1.1.1.1/32").unwrap();

        let rules = AclRules::build(&["10.0.0.0/8".to_string()]).unwrap();
        assert_eq!(rules.len(), 1);
        let previous = acl.install(rules);

        assert_eq!(previous.len(), 1);
        assert!(acl.is_denied("10.9.9.9".parse().unwrap()));
        assert!(!acl.is_denied("1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_errors() {
        let acl = AccessControlList::new();
        assert!(matches!(acl.add("10.0.0.1", "x"), Err(AclError::InvalidAddress(_))));
        assert!(matches!(acl.add("10.0.0/8", "x"), Err(AclError::InvalidAddress(_))));
        assert!(matches!(acl.add("10.0.0.1/33", "x"), Err(AclError::InvalidMask(_))));
        assert!(matches!(acl.add("10.0.0.1/ab", "x"), Err(AclError::InvalidMask(_))));
        assert_eq!(AclError::InvalidMask("x".into()).kind(), ErrorKind::Validation);
        assert!(acl.is_empty());
    }

    #[test]
    fn test_records_are_canonical() {
        let acl = AccessControlList::new();
        acl.add("10.0.0.7/24", "x").unwrap();
        assert_eq!(acl.list_all(), vec!["10.0.0.0/24".to_string()]);

        acl.delete("10.0.0.9/24").unwrap();
        assert!(acl.is_empty());
    }

    #[test]
    fn test_delete_missing() {
        let acl = AccessControlList::new();
        let err = acl.delete("10.0.0.0/24").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_ipv6_never_matches() {
        let acl = AccessControlList::new();
        acl.add("0.0.0.0/0", "all").unwrap();
        assert!(!acl.is_denied("2001:db8::1".parse().unwrap()));
        assert!(acl.is_denied("::ffff:10.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_replace_with() {
        let acl = AccessControlList::new();
        acl.add("1.1.1.1/32", "x").unwrap();
        acl.replace_with(&["10.0.0.0/8".to_string(), "172.16.0.0/12".to_string()])
            .unwrap();
        assert_eq!(acl.list_all(), vec!["10.0.0.0/8".to_string(), "172.16.0.0/12".to_string()]);
        assert!(!acl.is_denied("1.1.1.1".parse().unwrap()));
    }

    fn cidr_strategy() -> impl Strategy<Value = String> {
        (any::<u32>(), 0u8..=32).prop_map(|(addr, len)| {
            format!("{}/{}", Ipv4Addr::from(addr), len)
        })
    }

    proptest! {
        #[test]
        fn prop_insert_then_delete_returns_to_empty(
            cidrs in proptest::collection::vec(cidr_strategy(), 1..40),
            seed in any::<u64>(),
        ) {
            let acl = AccessControlList::new();
            for cidr in &cidrs {
                acl.add(cidr, cidr).unwrap();
            }

            let mut records = acl.list_all();
            // deterministic shuffle
            let len = records.len();
            for i in 0..len {
                let j = (seed.wrapping_mul(i as u64 + 1) % len as u64) as usize;
                records.swap(i, j);
            }

            for record in &records {
                acl.delete(record).unwrap();
            }

            prop_assert_eq!(acl.len(), 0);
            prop_assert_eq!(acl.node_count(), 1);
            for cidr in &cidrs {
                let addr = cidr.split('/').next().unwrap();
                prop_assert!(acl.search(addr).unwrap().is_none());
            }
        }
    }
}
