//! Replicated log entry codec.
//!
//! An entry is a 2-byte big-endian operation code followed by a JSON payload.

use std::fmt;

use concord_config::Location;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::LimiterInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    CreatePool = 1,
    SetRateLimiter = 2,
    AclMutate = 3,
    RemovePool = 4,
    RemoveHost = 5,
    AddHost = 6,
    ChangeBalancer = 7,
}

impl OpCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1 => OpCode::CreatePool,
            2 => OpCode::SetRateLimiter,
            3 => OpCode::AclMutate,
            4 => OpCode::RemovePool,
            5 => OpCode::RemoveHost,
            6 => OpCode::AddHost,
            7 => OpCode::ChangeBalancer,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::CreatePool => "create_pool",
            OpCode::SetRateLimiter => "set_rate_limiter",
            OpCode::AclMutate => "acl_mutate",
            OpCode::RemovePool => "remove_pool",
            OpCode::RemoveHost => "remove_host",
            OpCode::AddHost => "add_host",
            OpCode::ChangeBalancer => "change_balancer",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ACL mutation kind, `0` on the wire for delete and `1` for insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AclAction {
    Delete,
    Insert,
}

impl From<AclAction> for u8 {
    fn from(action: AclAction) -> u8 {
        match action {
            AclAction::Delete => 0,
            AclAction::Insert => 1,
        }
    }
}

impl TryFrom<u8> for AclAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AclAction::Delete),
            1 => Ok(AclAction::Insert),
            other => Err(format!("unknown acl action {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclMutation {
    pub action: AclAction,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePool {
    pub pattern: String,
}

/// Payload of add-host and remove-host entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostChange {
    pub pattern: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBalancer {
    pub pattern: String,
    pub balance_mode: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log entry is {0} bytes, shorter than its op code")]
    TooShort(usize),

    #[error("unknown op code {0}")]
    UnknownOpCode(u16),

    #[error("malformed {op} payload: {source}")]
    Payload {
        op: OpCode,
        #[source]
        source: serde_json::Error,
    },
}

/// One decoded configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    CreatePool(Location),
    SetRateLimiter(LimiterInfo),
    AclMutate(AclMutation),
    RemovePool(RemovePool),
    RemoveHost(HostChange),
    AddHost(HostChange),
    ChangeBalancer(ChangeBalancer),
}

impl LogEntry {
    pub fn op(&self) -> OpCode {
        match self {
            LogEntry::CreatePool(_) => OpCode::CreatePool,
            LogEntry::SetRateLimiter(_) => OpCode::SetRateLimiter,
            LogEntry::AclMutate(_) => OpCode::AclMutate,
            LogEntry::RemovePool(_) => OpCode::RemovePool,
            LogEntry::RemoveHost(_) => OpCode::RemoveHost,
            LogEntry::AddHost(_) => OpCode::AddHost,
            LogEntry::ChangeBalancer(_) => OpCode::ChangeBalancer,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = match self {
            LogEntry::CreatePool(p) => serde_json::to_vec(p)?,
            LogEntry::SetRateLimiter(p) => serde_json::to_vec(p)?,
            LogEntry::AclMutate(p) => serde_json::to_vec(p)?,
            LogEntry::RemovePool(p) => serde_json::to_vec(p)?,
            LogEntry::RemoveHost(p) | LogEntry::AddHost(p) => serde_json::to_vec(p)?,
            LogEntry::ChangeBalancer(p) => serde_json::to_vec(p)?,
        };

        let mut buf = Vec::with_capacity(2 + payload.len());
        buf.extend_from_slice(&self.op().as_u16().to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let [hi, lo, payload @ ..] = bytes else {
            return Err(DecodeError::TooShort(bytes.len()));
        };
        let code = u16::from_be_bytes([*hi, *lo]);
        let op = OpCode::from_u16(code).ok_or(DecodeError::UnknownOpCode(code))?;

        Ok(match op {
            OpCode::CreatePool => LogEntry::CreatePool(payload_of(op, payload)?),
            OpCode::SetRateLimiter => LogEntry::SetRateLimiter(payload_of(op, payload)?),
            OpCode::AclMutate => LogEntry::AclMutate(payload_of(op, payload)?),
            OpCode::RemovePool => LogEntry::RemovePool(payload_of(op, payload)?),
            OpCode::RemoveHost => LogEntry::RemoveHost(payload_of(op, payload)?),
            OpCode::AddHost => LogEntry::AddHost(payload_of(op, payload)?),
            OpCode::ChangeBalancer => LogEntry::ChangeBalancer(payload_of(op, payload)?),
        })
    }

    pub fn create_pool(location: Location) -> Self {
        LogEntry::CreatePool(location)
    }

    pub fn acl(action: AclAction, cidr: impl Into<String>) -> Self {
        LogEntry::AclMutate(AclMutation {
            action,
            cidr: cidr.into(),
        })
    }

    pub fn remove_pool(pattern: impl Into<String>) -> Self {
        LogEntry::RemovePool(RemovePool {
            pattern: pattern.into(),
        })
    }

    pub fn add_host(pattern: impl Into<String>, host: impl Into<String>) -> Self {
        LogEntry::AddHost(HostChange {
            pattern: pattern.into(),
            host: host.into(),
        })
    }

    pub fn remove_host(pattern: impl Into<String>, host: impl Into<String>) -> Self {
        LogEntry::RemoveHost(HostChange {
            pattern: pattern.into(),
            host: host.into(),
        })
    }

    pub fn change_balancer(pattern: impl Into<String>, mode: impl Into<String>) -> Self {
        LogEntry::ChangeBalancer(ChangeBalancer {
            pattern: pattern.into(),
            balance_mode: mode.into(),
        })
    }
}

fn payload_of<T: DeserializeOwned>(op: OpCode, payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Payload { op, source })
}
