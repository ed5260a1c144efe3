//! Single-process consensus.
//!
//! Commits every proposal immediately, in arrival order, to a primary state
//! machine and to any number of replica state machines. Used by standalone
//! nodes and by tests that check replicas stay identical.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_common::{LogIndex, NodeName};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::consensus::{Commit, Consensus, ConsensusError, StateMachine};
use super::snapshot::PersistedSnapshot;

pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1_024;

#[derive(Default)]
struct LogState {
    last_index: LogIndex,
    last_snapshot_index: LogIndex,
    snapshot: Option<Vec<u8>>,
}

struct Inner {
    node: NodeName,
    primary: Arc<dyn StateMachine>,
    replicas: Vec<Arc<dyn StateMachine>>,
    log: Mutex<LogState>,
    snapshot_threshold: u64,
    data_dir: Option<PathBuf>,
}

impl Inner {
    fn machines(&self) -> impl Iterator<Item = &Arc<dyn StateMachine>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    async fn commit(&self, entry: Vec<u8>) -> Result<Commit, ConsensusError> {
        let mut log = self.log.lock().await;
        let index = log.last_index.next();

        let outcome = self.primary.apply(index, &entry).await;
        for (i, replica) in self.replicas.iter().enumerate() {
            let replica_outcome = replica.apply(index, &entry).await;
            if replica_outcome.is_ok() != outcome.is_ok() {
                warn!(
                    index = %index,
                    replica = i,
                    "Replica apply outcome differs from primary"
                );
            }
        }
        log.last_index = index;

        if self.snapshot_threshold > 0
            && index.distance_from(log.last_snapshot_index) >= self.snapshot_threshold
        {
            if let Err(e) = self.take_snapshot(&mut log).await {
                warn!(index = %index, error = %e, "Automatic snapshot failed");
            }
        }

        Ok(Commit { index, outcome })
    }

    async fn take_snapshot(&self, log: &mut LogState) -> Result<LogIndex, ConsensusError> {
        let bytes = self.primary.snapshot()?;
        let index = log.last_index;

        if let Some(dir) = &self.data_dir {
            PersistedSnapshot::new(index, self.node.clone(), &bytes)?
                .write(dir)
                .await?;
        }

        debug!(index = %index, bytes = bytes.len(), "Snapshot taken");
        log.last_snapshot_index = index;
        log.snapshot = Some(bytes);
        Ok(index)
    }
}

/// Loopback [`Consensus`].
///
/// Commits are serialised through one async mutex, so no two applies ever
/// run at the same time.
#[derive(Clone)]
pub struct LocalConsensus {
    inner: Arc<Inner>,
}

/// Builder for [`LocalConsensus`].
pub struct LocalConsensusBuilder {
    node: NodeName,
    primary: Arc<dyn StateMachine>,
    replicas: Vec<Arc<dyn StateMachine>>,
    snapshot_threshold: u64,
    data_dir: Option<PathBuf>,
}

impl LocalConsensusBuilder {
    pub fn node_name(mut self, node: NodeName) -> Self {
        self.node = node;
        self
    }

    /// Deliver every committed entry to `replica` as well, after the primary.
    pub fn replica(mut self, replica: Arc<dyn StateMachine>) -> Self {
        self.replicas.push(replica);
        self
    }

    /// Committed entries between automatic snapshots; zero disables them.
    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn data_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn build(self) -> LocalConsensus {
        LocalConsensus {
            inner: Arc::new(Inner {
                node: self.node,
                primary: self.primary,
                replicas: self.replicas,
                log: Mutex::new(LogState::default()),
                snapshot_threshold: self.snapshot_threshold,
                data_dir: self.data_dir,
            }),
        }
    }
}

impl LocalConsensus {
    pub fn builder(primary: Arc<dyn StateMachine>) -> LocalConsensusBuilder {
        LocalConsensusBuilder {
            node: NodeName::default(),
            primary,
            replicas: Vec::new(),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            data_dir: None,
        }
    }

    pub fn new(primary: Arc<dyn StateMachine>) -> Self {
        Self::builder(primary).build()
    }

    /// Restore every state machine from the persisted snapshot, if any.
    ///
    /// Returns the index the snapshot was taken at.
    pub async fn recover(&self) -> Result<Option<LogIndex>, ConsensusError> {
        let Some(dir) = &self.inner.data_dir else {
            return Ok(None);
        };
        let Some(persisted) = PersistedSnapshot::load(dir).await? else {
            debug!(data_dir = ?dir, "No snapshot to recover");
            return Ok(None);
        };

        let bytes = persisted.state_bytes()?;
        let mut log = self.inner.log.lock().await;
        for machine in self.inner.machines() {
            machine.restore(&bytes)?;
        }
        log.last_index = persisted.index;
        log.last_snapshot_index = persisted.index;
        log.snapshot = Some(bytes);

        info!(
            index = %persisted.index,
            created_at = %persisted.created_at,
            node = %persisted.node,
            "Recovered from snapshot"
        );
        Ok(Some(persisted.index))
    }

    /// Snapshot the primary now, persisting it when a data dir is set.
    pub async fn snapshot_now(&self) -> Result<LogIndex, ConsensusError> {
        let mut log = self.inner.log.lock().await;
        self.inner.take_snapshot(&mut log).await
    }

    /// The latest snapshot taken, if any.
    pub async fn latest_snapshot(&self) -> Option<Vec<u8>> {
        self.inner.log.lock().await.snapshot.clone()
    }

    /// Restore every state machine from `snapshot`, the way a follower
    /// catches up from its leader.
    pub async fn install_snapshot(&self, snapshot: &[u8]) -> Result<(), ConsensusError> {
        let _log = self.inner.log.lock().await;
        for machine in self.inner.machines() {
            machine.restore(snapshot)?;
        }
        info!(bytes = snapshot.len(), "Snapshot installed");
        Ok(())
    }

    pub fn replica_count(&self) -> usize {
        self.inner.replicas.len()
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn propose(&self, entry: Vec<u8>, timeout: Duration) -> Result<Commit, ConsensusError> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.commit(entry).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ConsensusError::Aborted(join.to_string())),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Proposal timed out");
                Err(ConsensusError::Timeout(timeout))
            }
        }
    }

    async fn last_applied(&self) -> LogIndex {
        self.inner.log.lock().await.last_index
    }
}

impl std::fmt::Debug for LocalConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConsensus")
            .field("node", &self.inner.node)
            .field("replicas", &self.inner.replicas.len())
            .field("snapshot_threshold", &self.inner.snapshot_threshold)
            .finish_non_exhaustive()
    }
}
