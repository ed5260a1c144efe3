//! Shared building blocks for the Concord workspace.
//!
//! - [`ids`]: identifier newtypes used across the control plane
//! - [`errors`]: the error taxonomy every component classifies into
//! - [`observability`]: tracing subscriber initialisation

pub mod errors;
pub mod ids;
pub mod observability;

pub use errors::{Classify, ErrorKind};
pub use ids::{LogIndex, NodeName};
pub use observability::{init_tracing, LogFormat, UnknownLogFormat};
