//! One Concord node: every component wired from a [`Config`].

use std::sync::Arc;

use concord_common::{Classify, ErrorKind, LogIndex, NodeName};
use concord_config::Config;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::acl::AccessControlList;
use crate::balancer::{BalancerRegistry, BalancerSettings};
use crate::cluster::{ConsensusError, LocalConsensus, ProxyStateMachine};
use crate::control::{ControlError, ControlPlane};
use crate::limiter::LimiterRegistry;
use crate::metrics::ProxyMetrics;
use crate::routing::RoutingTable;
use crate::shutdown::ShutdownCoordinator;
use crate::upstream::HealthCheck;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("bootstrap of location '{pattern}' failed: {source}")]
    Bootstrap {
        pattern: String,
        #[source]
        source: ControlError,
    },
}

impl Classify for NodeError {
    fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Metrics(_) => ErrorKind::Internal,
            NodeError::Consensus(e) => e.kind(),
            NodeError::Bootstrap { source, .. } => source.kind(),
        }
    }
}

/// A running node: state machine, loopback consensus, control plane.
pub struct Node {
    name: NodeName,
    config: Config,
    metrics: Arc<ProxyMetrics>,
    table: Arc<RoutingTable>,
    fsm: Arc<ProxyStateMachine>,
    consensus: LocalConsensus,
    control: ControlPlane,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Node {
    /// Build every component. Nothing is proposed or restored yet.
    pub fn build(config: Config) -> Result<Self, NodeError> {
        let name = NodeName::new(config.node.name.clone());
        let metrics = Arc::new(ProxyMetrics::new()?);
        let shutdown = Arc::new(ShutdownCoordinator::default());

        let balancers = BalancerRegistry::with_defaults(BalancerSettings {
            replicas: config.load_balance.replicas,
        });
        let mut table = RoutingTable::new(
            Arc::new(AccessControlList::new()),
            balancers,
            LimiterRegistry::with_defaults(),
            metrics.clone(),
        )
        .with_host_shutdown_timeout(config.health_check.host_shutdown_timeout())
        .with_shutdown(shutdown.clone());

        if config.health_check.enabled {
            table = table.with_health_check(HealthCheck::tcp(
                config.health_check.interval(),
                config.health_check.connect_timeout(),
            ));
        }

        let table = Arc::new(table);
        let fsm = Arc::new(ProxyStateMachine::new(table.clone()));
        let consensus = LocalConsensus::builder(fsm.clone())
            .node_name(name.clone())
            .snapshot_threshold(config.cluster.snapshot_threshold)
            .data_dir(config.node.data_dir.clone())
            .build();
        let control = ControlPlane::new(Arc::new(consensus.clone()), fsm.clone())
            .with_propose_timeout(config.cluster.propose_timeout());

        debug!(
            node = %name,
            health_checks = config.health_check.enabled,
            data_dir = ?config.node.data_dir,
            "Node built"
        );

        Ok(Self {
            name,
            config,
            metrics,
            table,
            fsm,
            consensus,
            control,
            shutdown,
        })
    }

    /// Recover from the persisted snapshot, or propose the static locations
    /// when there is none and bootstrap is enabled.
    pub async fn start(&self) -> Result<(), NodeError> {
        if let Some(index) = self.consensus.recover().await? {
            info!(node = %self.name, index = %index, pools = self.table.len(), "Node recovered");
            return Ok(());
        }

        if !self.config.cluster.bootstrap {
            info!(node = %self.name, "Bootstrap disabled, starting empty");
            return Ok(());
        }

        for location in &self.config.locations {
            self.control
                .create_pool(location.clone())
                .await
                .map_err(|source| NodeError::Bootstrap {
                    pattern: location.pattern.clone(),
                    source,
                })?;
        }

        info!(
            node = %self.name,
            pools = self.table.len(),
            "Node bootstrapped from static configuration"
        );
        Ok(())
    }

    /// Stop taking writes and dispatches, drain in-flight dispatches, write
    /// a final snapshot and stop every pool.
    pub async fn shutdown(&self) -> Result<LogIndex, NodeError> {
        self.control.set_write_enabled(false);
        self.shutdown.request_shutdown();

        if !self.shutdown.wait_for_drain().await {
            warn!(
                node = %self.name,
                remaining = self.shutdown.in_flight(),
                "Shutting down with dispatches still in flight"
            );
        }

        let index = self.consensus.snapshot_now().await?;
        self.table.shutdown_pools();
        info!(node = %self.name, index = %index, "Node stopped");
        Ok(index)
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(&self) -> Result<LogIndex, NodeError> {
        wait_for_signal().await;
        self.shutdown().await
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn state_machine(&self) -> &Arc<ProxyStateMachine> {
        &self.fsm
    }

    pub fn consensus(&self) -> &LocalConsensus {
        &self.consensus
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("pools", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        },
        _ = term.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Received Ctrl-C, initiating graceful shutdown");
}
