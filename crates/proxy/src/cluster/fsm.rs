//! The replicated state machine: routing table plus ACL, changed only by
//! applying committed log entries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use concord_common::{Classify, ErrorKind, LogIndex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::consensus::StateMachine;
use super::entry::{AclAction, AclMutation, DecodeError, LogEntry};
use super::snapshot::{AclSnapshot, SnapshotError, StateSnapshot};
use crate::acl::{AccessControlList, AclError, AclRules};
use crate::metrics::ProxyMetrics;
use crate::routing::{RoutingError, RoutingTable};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to decode log entry: {0}")]
    Decode(#[from] DecodeError),

    #[error("state machine diverged, waiting for a snapshot restore")]
    Diverged,

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Acl(#[from] AclError),
}

impl Classify for ApplyError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApplyError::Decode(_) | ApplyError::Diverged => ErrorKind::ApplyDecode,
            ApplyError::Routing(e) => e.kind(),
            ApplyError::Acl(e) => e.kind(),
        }
    }
}

/// Routing table and ACL driven by the replicated log.
///
/// A decode failure means this node can no longer follow the log; it stays
/// diverged, refusing every further entry, until a snapshot is restored.
pub struct ProxyStateMachine {
    table: Arc<RoutingTable>,
    acl: Arc<AccessControlList>,
    metrics: Arc<ProxyMetrics>,
    diverged: AtomicBool,
    last_applied: AtomicU64,
}

impl ProxyStateMachine {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            acl: table.acl().clone(),
            metrics: table.metrics().clone(),
            table,
            diverged: AtomicBool::new(false),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn acl(&self) -> &Arc<AccessControlList> {
        &self.acl
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged.load(Ordering::Acquire)
    }

    pub fn last_applied(&self) -> LogIndex {
        LogIndex::new(self.last_applied.load(Ordering::Acquire))
    }

    pub fn state(&self) -> StateSnapshot {
        StateSnapshot {
            routing: self.table.snapshot(),
            acl: AclSnapshot {
                records: self.acl.list_all(),
            },
        }
    }

    async fn execute(&self, entry: LogEntry) -> Result<(), ApplyError> {
        match entry {
            LogEntry::CreatePool(location) => {
                self.table.add_pool_from_config(&location)?;
            }
            LogEntry::SetRateLimiter(info) => {
                self.table.set_rate_limiter(&info)?;
            }
            LogEntry::AclMutate(AclMutation { action, cidr }) => {
                match action {
                    AclAction::Insert => self.acl.block(&cidr)?,
                    AclAction::Delete => self.acl.delete(&cidr)?,
                }
                self.metrics.set_acl_rules(self.acl.len());
            }
            LogEntry::RemovePool(p) => {
                self.table.remove_proxy(&p.pattern)?;
            }
            LogEntry::RemoveHost(h) => {
                self.table.remove_host(&h.pattern, &h.host).await?;
            }
            LogEntry::AddHost(h) => {
                self.table.add_host(&h.pattern, &h.host)?;
            }
            LogEntry::ChangeBalancer(c) => {
                self.table.change_balancer(&c.pattern, &c.balance_mode)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateMachine for ProxyStateMachine {
    async fn apply(&self, index: LogIndex, entry: &[u8]) -> Result<(), ApplyError> {
        self.last_applied.store(index.as_u64(), Ordering::Release);

        if self.is_diverged() {
            self.metrics.record_apply_failure(ErrorKind::ApplyDecode.as_str());
            return Err(ApplyError::Diverged);
        }

        let entry = match LogEntry::decode(entry) {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    index = %index,
                    bytes = entry.len(),
                    error = %e,
                    "Failed to decode committed entry, node diverged"
                );
                self.diverged.store(true, Ordering::Release);
                self.metrics.record_apply_failure(ErrorKind::ApplyDecode.as_str());
                return Err(e.into());
            }
        };

        let op = entry.op();
        match self.execute(entry).await {
            Ok(()) => {
                debug!(index = %index, op = %op, "Applied log entry");
                self.metrics.record_applied(op.as_str());
                Ok(())
            }
            Err(e) => {
                warn!(index = %index, op = %op, error = %e, "Log entry apply failed");
                self.metrics.record_apply_failure(e.kind().as_str());
                Err(e)
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        self.state().to_bytes()
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        let snapshot = StateSnapshot::from_bytes(snapshot)?;

        // Records are canonical; anything unparsable is skipped like a failed
        // pool rebuild.
        let mut records = Vec::with_capacity(snapshot.acl.records.len());
        for record in &snapshot.acl.records {
            match crate::acl::parse_cidr(record) {
                Ok(net) => records.push(net.to_string()),
                Err(e) => error!(cidr = %record, error = %e, "Skipping ACL record"),
            }
        }

        match AclRules::build(&records) {
            Ok(rules) => self.table.restore_with_acl(&snapshot.routing, rules),
            Err(e) => {
                error!(error = %e, "Failed to rebuild ACL");
                self.table.restore(&snapshot.routing);
            }
        }
        self.metrics.set_acl_rules(self.acl.len());

        if self.diverged.swap(false, Ordering::AcqRel) {
            info!("Snapshot restored, node resynchronised");
        }
        info!(
            pools = self.table.len(),
            acl_rules = self.acl.len(),
            "State machine restored"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ProxyStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyStateMachine")
            .field("diverged", &self.is_diverged())
            .field("last_applied", &self.last_applied())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerRegistry, BalancerSettings, ROUND_ROBIN};
    use crate::limiter::{LimiterRegistry, QPS};
    use crate::routing::LimiterInfo;
    use crate::upstream::DispatchError;
    use concord_config::Location;

    fn machine() -> ProxyStateMachine {
        let table = RoutingTable::new(
            Arc::new(AccessControlList::new()),
            BalancerRegistry::with_defaults(BalancerSettings::default()),
            LimiterRegistry::with_defaults(),
            Arc::new(ProxyMetrics::new().unwrap()),
        );
        ProxyStateMachine::new(Arc::new(table))
    }

    fn create(pattern: &str, host: &str) -> Vec<u8> {
        LogEntry::create_pool(Location::new(pattern, vec![host.to_string()], ROUND_ROBIN))
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_create_pool_and_limiter() {
        let fsm = machine();
        fsm.apply(LogIndex::new(1), &create("/api", "http://127.0.0.1:8000"))
            .await
            .unwrap();
        // second create is a no-op
        fsm.apply(LogIndex::new(2), &create("/api", "http://127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(
            fsm.table().location("/api").unwrap().proxy_pass,
            vec!["http://127.0.0.1:8000".to_string()]
        );

        let limiter = LogEntry::SetRateLimiter(LimiterInfo::new("/api", "/u", QPS).with_rate(4, 2));
        fsm.apply(LogIndex::new(3), &limiter.encode().unwrap()).await.unwrap();
        assert_eq!(fsm.table().limiter_info("/api", "/u").unwrap().volume, 4);
        assert_eq!(fsm.last_applied(), LogIndex::new(3));
    }

    #[tokio::test]
    async fn test_apply_acl() {
        let fsm = machine();
        let insert = LogEntry::acl(AclAction::Insert, "10.0.0.0/24").encode().unwrap();
        fsm.apply(LogIndex::new(1), &insert).await.unwrap();
        assert!(fsm.acl().is_denied("10.0.0.9".parse().unwrap()));

        let delete = LogEntry::acl(AclAction::Delete, "10.0.0.0/24").encode().unwrap();
        fsm.apply(LogIndex::new(2), &delete).await.unwrap();
        assert!(fsm.acl().is_empty());

        let err = fsm.apply(LogIndex::new(3), &delete).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!fsm.is_diverged());
    }

    #[tokio::test]
    async fn test_not_found_keeps_applying() {
        let fsm = machine();
        let entry = LogEntry::SetRateLimiter(LimiterInfo::new("/missing", "/", QPS));
        let err = fsm
            .apply(LogIndex::new(1), &entry.encode().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        fsm.apply(LogIndex::new(2), &create("/api", "http://127.0.0.1:8000"))
            .await
            .unwrap();
        assert_eq!(fsm.table().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_diverges_until_restore() {
        let fsm = machine();
        fsm.apply(LogIndex::new(1), &create("/api", "http://127.0.0.1:8000"))
            .await
            .unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let err = fsm.apply(LogIndex::new(2), &[0, 42]).await.unwrap_err();
        assert!(matches!(err, ApplyError::Decode(DecodeError::UnknownOpCode(42))));
        assert!(fsm.is_diverged());

        let err = fsm
            .apply(LogIndex::new(3), &create("/web", "http://127.0.0.1:8001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Diverged));
        assert!(fsm.table().pool("/web").is_none());

        fsm.restore(&snapshot).unwrap();
        assert!(!fsm.is_diverged());
        fsm.apply(LogIndex::new(4), &create("/web", "http://127.0.0.1:8001"))
            .await
            .unwrap();
        assert_eq!(fsm.table().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_acl() {
        let source = machine();
        for cidr in ["10.0.0.0/24", "192.168.0.0/16"] {
            let entry = LogEntry::acl(AclAction::Insert, cidr).encode().unwrap();
            source.apply(LogIndex::new(1), &entry).await.unwrap();
        }
        let snapshot = source.snapshot().unwrap();

        let replica = machine();
        replica.acl().block("1.1.1.0/24").unwrap();
        replica.restore(&snapshot).unwrap();

        assert_eq!(replica.acl().list_all(), source.acl().list_all());
        assert!(replica.acl().is_denied("192.168.4.4".parse().unwrap()));
        assert!(!replica.acl().is_denied("1.1.1.1".parse().unwrap()));
        assert_eq!(replica.snapshot().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_acl_tag_survives_restore() {
        let source = machine();
        let entry = LogEntry::acl(AclAction::Insert, "10.0.0.7/24").encode().unwrap();
        source.apply(LogIndex::new(1), &entry).await.unwrap();
        let before = source.acl().search("10.0.0.9").unwrap();
        assert_eq!(before.as_deref(), Some("10.0.0.0/24"));

        let replica = machine();
        replica.restore(&source.snapshot().unwrap()).unwrap();
        assert_eq!(replica.acl().search("10.0.0.9").unwrap(), before);
    }

    #[tokio::test]
    async fn test_restore_swaps_routes_and_acl_together() {
        // blocked: /a behind a 10/8 blacklist; open: /b with no rules
        let blocked = machine();
        blocked
            .apply(LogIndex::new(1), &create("/a", "http://127.0.0.1:8000"))
            .await
            .unwrap();
        let deny = LogEntry::acl(AclAction::Insert, "10.0.0.0/8").encode().unwrap();
        blocked.apply(LogIndex::new(2), &deny).await.unwrap();
        let blocked = blocked.snapshot().unwrap();

        let open = machine();
        open.apply(LogIndex::new(1), &create("/b", "http://127.0.0.1:9000"))
            .await
            .unwrap();
        let open = open.snapshot().unwrap();

        let fsm = Arc::new(machine());
        fsm.restore(&blocked).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let fsm = fsm.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let client: std::net::IpAddr = "10.0.0.1".parse().unwrap();
                let mut mixed = 0usize;
                loop {
                    if fsm.table().resolve("/a/x", client).is_ok() {
                        mixed += 1;
                    }
                    if let Err(DispatchError::Denied(_)) = fsm.table().resolve("/b/x", client) {
                        mixed += 1;
                    }
                    if stop.load(Ordering::Acquire) {
                        break mixed;
                    }
                }
            })
        };

        for i in 0..1000 {
            let snapshot = if i % 2 == 0 { &open } else { &blocked };
            fsm.restore(snapshot).unwrap();
        }
        stop.store(true, Ordering::Release);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let fsm = machine();
        assert!(matches!(fsm.restore(b"{"), Err(SnapshotError::Decode(_))));
    }
}
