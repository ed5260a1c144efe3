//! Point-in-time image of the replicated state, and its on-disk envelope.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use concord_common::{Classify, ErrorKind, LogIndex, NodeName};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::routing::RoutingSnapshot;

pub const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("snapshot i/o on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for SnapshotError {
    fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Decode(_) => ErrorKind::ApplyDecode,
            SnapshotError::Encode(_) | SnapshotError::Io { .. } => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSnapshot {
    pub records: Vec<String>,
}

/// Everything a replica needs to rebuild its routing table and ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub routing: RoutingSnapshot,
    pub acl: AclSnapshot,
}

impl StateSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(SnapshotError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        serde_json::from_slice(bytes).map_err(SnapshotError::Decode)
    }
}

/// A snapshot as written to `<data_dir>/snapshot.json`.
///
/// `state` holds the state machine's own snapshot document verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub index: LogIndex,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub node: NodeName,
    pub state: serde_json::Value,
}

impl PersistedSnapshot {
    pub fn new(index: LogIndex, node: NodeName, state: &[u8]) -> Result<Self, SnapshotError> {
        Ok(Self {
            index,
            created_at: Utc::now(),
            node,
            state: serde_json::from_slice(state).map_err(SnapshotError::Decode)?,
        })
    }

    /// The state machine snapshot bytes.
    pub fn state_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(&self.state).map_err(SnapshotError::Encode)
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(SNAPSHOT_FILE)
    }

    /// Write to `<data_dir>/snapshot.json`, replacing any previous file
    /// through a rename.
    pub async fn write(&self, data_dir: &Path) -> Result<PathBuf, SnapshotError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| SnapshotError::Io { path, source }
        };

        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(io_err(data_dir))?;

        let path = Self::path_in(data_dir);
        let tmp = data_dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(self).map_err(SnapshotError::Encode)?;

        tokio::fs::write(&tmp, &body).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

        debug!(path = ?path, index = %self.index, bytes = body.len(), "Snapshot persisted");
        Ok(path)
    }

    /// Load `<data_dir>/snapshot.json`, or `None` when there is none.
    pub async fn load(data_dir: &Path) -> Result<Option<Self>, SnapshotError> {
        let path = Self::path_in(data_dir);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };
        let snapshot: Self = serde_json::from_slice(&body).map_err(SnapshotError::Decode)?;
        debug!(path = ?path, index = %snapshot.index, "Snapshot loaded");
        Ok(Some(snapshot))
    }
}
