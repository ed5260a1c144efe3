//! Error taxonomy shared by every control-plane component.
//!
//! Concrete errors stay module-local `thiserror` enums; each one maps itself
//! onto an [`ErrorKind`] so callers (the control API, metrics, the binary) can
//! decide how to surface a failure without matching on every variant.

use serde::Serialize;
use std::fmt;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; rejected before any state mutation or proposal.
    Validation,
    /// Pool, host or ACL entry absent.
    NotFound,
    /// A rate limiter had no capacity left.
    Capacity,
    /// A proposal did not commit within its bound.
    ConsensusTimeout,
    /// A committed entry could not be decoded; the node needs resync.
    ApplyDecode,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Capacity => "capacity",
            ErrorKind::ConsensusTimeout => "consensus_timeout",
            ErrorKind::ApplyDecode => "apply_decode",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status a control or data-plane front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Capacity => 429,
            ErrorKind::ConsensusTimeout => 504,
            ErrorKind::ApplyDecode | ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can reach a caller.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
