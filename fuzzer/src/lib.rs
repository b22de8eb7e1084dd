//! Stress agreement protocols over a deterministic, fault-injecting virtual network.
//!
//! Every simulated node runs an unmodified [faultline_agreement::Participant] in its own task.
//! Nodes never talk to each other directly: all traffic flows through a [network::Network] that
//! advances in lockstep [Tick]s and passes every message through per-node [filter::Chain]s. A
//! chain may drop, delay, duplicate, reorder, reflect, or throttle traffic, restrict the
//! topology, or simply observe it. Chains are built from an ordered list of
//! [filter::Factory]s, either constructed in code or parsed from declarative JSON through a
//! [filter::Registry].
//!
//! The [validator::Validator] drives a network for a configured number of ticks, optionally lifts
//! every fault for a recovery phase, and summarizes round progress in a
//! [validator::RunResult].
//!
//! # Example
//!
//! ```rust
//! use faultline_agreement::mocks;
//! use faultline_fuzzer::{
//!     filter::{duplicate::Duplicate, topology::Topology},
//!     validator::{Config, Validator},
//!     FuzzerConfig,
//! };
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = FuzzerConfig::new("ring", 4)
//!     .with_filter(Topology::circular(4))
//!     .with_filter(Duplicate::default());
//! let mut validator = Validator::new(
//!     Config {
//!         network_run_ticks: 100,
//!         network_recover_ticks: 0,
//!         lift_faults: false,
//!     },
//!     Arc::new(mocks::Builder::default()),
//! );
//! let result = validator.go(&config).await.unwrap();
//! assert!(!result.network_stalled);
//! # });
//! ```
//!
//! # Status
//!
//! `faultline-fuzzer` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use bytes::Bytes;
use faultline_agreement::{
    wire::{self, Digest},
    NodeId, Tag, Tick,
};
use thiserror::Error;

pub mod config;
pub mod filter;
pub mod network;
pub mod telemetry;
pub mod validator;

pub use config::{FuzzerConfig, LogLevel};

/// Errors that can occur when configuring or running a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid schedule: first bound ({0}) must be below second bound ({1})")]
    InvalidSchedule(Tick, Tick),
    #[error("missing schedule bound: {0}")]
    MissingBound(&'static str),
    #[error("invalid online nodes: expected {expected} entries, found {found}")]
    InvalidOnlineNodes { expected: usize, found: usize },
    #[error("network has no nodes")]
    NoNodes,
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("unrecognized filter: {0}")]
    UnrecognizedFilter(String),
    #[error("invalid filter option: {0}")]
    InvalidOption(&'static str),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("network already started")]
    AlreadyStarted,
    #[error("network not started")]
    NotStarted,
    #[error("network closed")]
    NetworkClosed,
    #[error("node failed: {0}")]
    NodeFailed(NodeId),
}

/// A message in flight between two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Node that sent this copy (the last hop).
    pub source: NodeId,
    /// Node this copy is addressed to.
    pub destination: NodeId,
    /// Node that created the payload.
    pub origin: NodeId,
    pub tag: Tag,
    pub payload: Bytes,
    /// Tick at which this copy was sent.
    pub sent: Tick,
}

impl Message {
    /// Size of the message in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Digest of the message content, independent of who sent it or to whom.
    pub fn digest(&self) -> Digest {
        wire::digest(self.tag, &self.payload)
    }

    /// A copy of the message sent back from `destination` to `source`.
    pub fn bounce(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            ..self.clone()
        }
    }

    /// A copy of the message re-sent by `source` to `destination`.
    pub fn forward(&self, source: NodeId, destination: NodeId) -> Self {
        Self {
            source,
            destination,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;

    /// A message of `tag` from `source` to `destination` with a small payload.
    pub fn message(source: NodeId, destination: NodeId, tag: Tag, payload: &'static [u8]) -> Message {
        Message {
            source,
            destination,
            origin: source,
            tag,
            payload: Bytes::from_static(payload),
            sent: 0,
        }
    }
}
