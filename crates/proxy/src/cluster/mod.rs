//! Replication: log entry codec, the state machine that applies entries, and
//! the consensus seam that orders them.

pub mod consensus;
pub mod entry;
pub mod fsm;
pub mod local;
pub mod snapshot;

pub use consensus::{Commit, Consensus, ConsensusError, StateMachine};
pub use entry::{AclAction, DecodeError, LogEntry, OpCode};
pub use fsm::{ApplyError, ProxyStateMachine};
pub use local::{LocalConsensus, LocalConsensusBuilder};
pub use snapshot::{PersistedSnapshot, SnapshotError, StateSnapshot};
