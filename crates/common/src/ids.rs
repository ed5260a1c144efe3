//! Type-safe identifier newtypes for the Concord control plane.
//!
//! These keep log positions and node names from being mixed up with the many
//! other integers and strings that flow through the state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a committed entry in the replicated log.
///
/// Index 0 means "nothing committed yet"; the first committed entry is 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The index immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of entries committed after `earlier`.
    pub fn distance_from(self, earlier: LogIndex) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

/// Name of a node in the cluster.
///
/// Only used for logging and snapshot metadata; the state machine never
/// depends on local node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeName {
    fn default() -> Self {
        Self("concord".to_string())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
