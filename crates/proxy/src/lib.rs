//! Concord Proxy Library
//!
//! Replicated control plane for a clustered reverse proxy. Operators change
//! configuration on any node; the change is proposed to consensus and applied
//! on every node in the same order, so all nodes route the same way.
//!
//! - **ACL**: IPv4 CIDR blacklist on a memory-reusing binary trie
//! - **Routing**: longest-prefix match from URL path to backend pool
//! - **Upstream**: backend pools with health checks and pluggable balancers
//! - **Limiters**: per-path QPS and concurrency throttles
//! - **Cluster**: log entry codec, state machine, snapshot and restore
//! - **Control**: validate, propose, await commit
//!
//! # Example
//!
//! ```ignore
//! use concord_config::Config;
//! use concord_proxy::Node;
//!
//! let node = Node::build(Config::from_file("concord.toml")?)?;
//! node.start().await?;
//! let guard = node.table().dispatch("/api/users", client_ip).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acl;
pub mod balancer;
pub mod cluster;
pub mod control;
pub mod limiter;
pub mod metrics;
pub mod node;
pub mod routing;
pub mod shutdown;
pub mod upstream;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Access control
pub use acl::{AccessControlList, AclError, AclRules, CidrTrie};

// Policies
pub use balancer::{Balancer, BalancerError, BalancerRegistry, BalancerSettings};
pub use limiter::{LimiterError, LimiterRegistry, RateLimiter};

// Routing and pools
pub use routing::{LimiterInfo, PrefixRouter, RoutingError, RoutingSnapshot, RoutingTable};
pub use upstream::{BackendPool, DispatchError, DispatchGuard, HealthCheck, PoolInfo};

// Replication
pub use cluster::{
    ApplyError, Consensus, ConsensusError, LocalConsensus, LogEntry, ProxyStateMachine,
    StateMachine, StateSnapshot,
};

// Control plane and node
pub use control::{ControlError, ControlPlane};
pub use node::{Node, NodeError};

// Observability
pub use metrics::ProxyMetrics;
pub use shutdown::ShutdownCoordinator;
