//! The seam between the control plane and whatever orders the log.
//!
//! A [`Consensus`] implementation accepts opaque entries, agrees on their
//! order and hands each committed entry to its [`StateMachine`] exactly once,
//! never concurrently with another apply.

use std::time::Duration;

use async_trait::async_trait;
use concord_common::{Classify, ErrorKind, LogIndex};
use thiserror::Error;

use super::fsm::ApplyError;
use super::snapshot::SnapshotError;

/// Callbacks a consensus implementation drives.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry. Must be a deterministic function of the
    /// current state and `entry`.
    async fn apply(&self, index: LogIndex, entry: &[u8]) -> Result<(), ApplyError>;

    /// Serialize the current state.
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError>;

    /// Replace the current state with a snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<(), SnapshotError>;
}

/// A committed proposal and the result of applying it on this node.
#[derive(Debug)]
pub struct Commit {
    pub index: LogIndex,
    pub outcome: Result<(), ApplyError>,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The entry may still commit later.
    #[error("proposal did not commit within {0:?}")]
    Timeout(Duration),

    #[error("proposal task failed: {0}")]
    Aborted(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl Classify for ConsensusError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::Timeout(_) => ErrorKind::ConsensusTimeout,
            ConsensusError::Aborted(_) => ErrorKind::Internal,
            ConsensusError::Snapshot(e) => e.kind(),
        }
    }
}

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Replicate `entry` and wait at most `timeout` for it to commit.
    async fn propose(&self, entry: Vec<u8>, timeout: Duration) -> Result<Commit, ConsensusError>;

    /// Index of the last entry applied on this node.
    async fn last_applied(&self) -> LogIndex;
}
