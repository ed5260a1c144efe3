//! Write path for operators.
//!
//! Every mutation is validated against local state, encoded, proposed and
//! awaited. Nothing is applied locally before it commits; the outcome of the
//! committed apply is what the caller gets back.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_common::{Classify, ErrorKind, LogIndex};
use concord_config::{parse_backend, Location};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acl::parse_cidr;
use crate::cluster::{AclAction, ApplyError, Consensus, ConsensusError, LogEntry, ProxyStateMachine};
use crate::routing::{LimiterInfo, LimiterStatus, RoutingTable};
use crate::upstream::PoolInfo;

pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("this node is not accepting writes")]
    WriteDisabled,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("failed to encode log entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("committed at index {index} but apply failed: {source}")]
    Apply {
        index: LogIndex,
        #[source]
        source: ApplyError,
    },
}

impl Classify for ControlError {
    fn kind(&self) -> ErrorKind {
        match self {
            ControlError::WriteDisabled | ControlError::Validation(_) => ErrorKind::Validation,
            ControlError::NotFound(_) => ErrorKind::NotFound,
            ControlError::Encode(_) => ErrorKind::Internal,
            ControlError::Consensus(e) => e.kind(),
            ControlError::Apply { source, .. } => source.kind(),
        }
    }
}

/// Operator-facing facade over one node.
pub struct ControlPlane {
    consensus: Arc<dyn Consensus>,
    fsm: Arc<ProxyStateMachine>,
    write_enabled: AtomicBool,
    propose_timeout: Duration,
}

impl ControlPlane {
    pub fn new(consensus: Arc<dyn Consensus>, fsm: Arc<ProxyStateMachine>) -> Self {
        Self {
            consensus,
            fsm,
            write_enabled: AtomicBool::new(true),
            propose_timeout: DEFAULT_PROPOSE_TIMEOUT,
        }
    }

    pub fn with_propose_timeout(mut self, timeout: Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    /// Accept or refuse writes, e.g. on leadership change.
    pub fn set_write_enabled(&self, enabled: bool) {
        let was = self.write_enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(write_enabled = enabled, "Control plane write mode changed");
        }
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::Acquire)
    }

    fn table(&self) -> &Arc<RoutingTable> {
        self.fsm.table()
    }

    fn require_pool(&self, pattern: &str) -> Result<(), ControlError> {
        if self.table().pool(pattern).is_none() {
            return Err(ControlError::NotFound(format!(
                "no pool registered for pattern '{pattern}'"
            )));
        }
        Ok(())
    }

    async fn propose(&self, entry: LogEntry) -> Result<LogIndex, ControlError> {
        if !self.write_enabled() {
            return Err(ControlError::WriteDisabled);
        }

        let op = entry.op();
        let bytes = entry.encode()?;
        let commit = self.consensus.propose(bytes, self.propose_timeout).await?;

        match commit.outcome {
            Ok(()) => {
                debug!(op = %op, index = %commit.index, "Proposal committed");
                Ok(commit.index)
            }
            Err(source) => {
                warn!(op = %op, index = %commit.index, error = %source, "Committed entry failed to apply");
                Err(ControlError::Apply {
                    index: commit.index,
                    source,
                })
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn create_pool(&self, location: Location) -> Result<LogIndex, ControlError> {
        location.check().map_err(ControlError::Validation)?;
        if !self.table().balancers().contains(&location.balance_mode) {
            return Err(ControlError::Validation(format!(
                "balance mode '{}' is not supported",
                location.balance_mode
            )));
        }
        self.propose(LogEntry::create_pool(location)).await
    }

    pub async fn set_rate_limiter(&self, info: LimiterInfo) -> Result<LogIndex, ControlError> {
        if !info.path_name.starts_with('/') {
            return Err(ControlError::Validation(format!(
                "limiter path '{}' must start with '/'",
                info.path_name
            )));
        }
        if !self.table().limiter_registry().contains(&info.limiter_type) {
            return Err(ControlError::Validation(format!(
                "limiter type '{}' is not supported",
                info.limiter_type
            )));
        }
        self.require_pool(&info.prefix)?;
        self.propose(LogEntry::SetRateLimiter(info)).await
    }

    pub async fn mutate_acl(&self, action: AclAction, cidr: &str) -> Result<LogIndex, ControlError> {
        let net = parse_cidr(cidr).map_err(|e| ControlError::Validation(e.to_string()))?;
        if action == AclAction::Delete && !self.fsm.acl().list_all().contains(&net.to_string()) {
            return Err(ControlError::NotFound(format!("no rule registered for '{cidr}'")));
        }
        self.propose(LogEntry::acl(action, net.to_string())).await
    }

    pub async fn remove_pool(&self, pattern: &str) -> Result<LogIndex, ControlError> {
        self.require_pool(pattern)?;
        self.propose(LogEntry::remove_pool(pattern)).await
    }

    pub async fn add_host(&self, pattern: &str, host: &str) -> Result<LogIndex, ControlError> {
        parse_backend(host).map_err(ControlError::Validation)?;
        self.require_pool(pattern)?;
        self.propose(LogEntry::add_host(pattern, host)).await
    }

    /// `host` is a backend URL or a `host:port` key.
    pub async fn remove_host(&self, pattern: &str, host: &str) -> Result<LogIndex, ControlError> {
        if host.trim().is_empty() {
            return Err(ControlError::Validation("host must not be empty".to_string()));
        }
        self.require_pool(pattern)?;
        self.propose(LogEntry::remove_host(pattern, host)).await
    }

    pub async fn change_balancer(&self, pattern: &str, mode: &str) -> Result<LogIndex, ControlError> {
        if !self.table().balancers().contains(mode) {
            return Err(ControlError::Validation(format!(
                "balance mode '{mode}' is not supported"
            )));
        }
        self.require_pool(pattern)?;
        self.propose(LogEntry::change_balancer(pattern, mode)).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn pools(&self) -> Vec<PoolInfo> {
        self.table().pools()
    }

    pub fn methods(&self, pattern: &str) -> Result<Vec<String>, ControlError> {
        self.table()
            .methods(pattern)
            .map_err(|e| ControlError::NotFound(e.to_string()))
    }

    pub fn limiter_info(&self, pattern: &str, path: &str) -> Result<LimiterStatus, ControlError> {
        self.table()
            .limiter_info(pattern, path)
            .map_err(|e| ControlError::NotFound(e.to_string()))
    }

    pub fn acl_list(&self) -> Vec<String> {
        self.fsm.acl().list_all()
    }

    /// Tag of the ACL block matching `ip`, if any.
    pub fn acl_lookup(&self, ip: IpAddr) -> Option<String> {
        self.fsm.acl().search(&ip.to_string()).ok().flatten()
    }

    pub fn balancer_modes(&self) -> Vec<String> {
        self.table().balancer_modes()
    }

    pub fn limiter_types(&self) -> Vec<String> {
        self.table().limiter_types()
    }

    pub fn is_diverged(&self) -> bool {
        self.fsm.is_diverged()
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("write_enabled", &self.write_enabled())
            .field("propose_timeout", &self.propose_timeout)
            .finish_non_exhaustive()
    }
}
