//! Drive an agreement protocol through a tick-based virtual transport.
//!
//! This crate is the seam between an agreement (consensus) protocol and the simulator that
//! hosts it. It defines:
//!
//! - the identifiers and logical clock shared by both sides ([NodeId], [Tick], [Round],
//!   [Period], [Step]),
//! - the [Participant] interface a protocol instance implements and the [Builder] that
//!   constructs one per simulated node,
//! - the [wire] format of the messages the simulator is allowed to inspect (votes, proposals,
//!   and bundles).
//!
//! The protocol itself is opaque to the simulator. Enable the `mocks` feature for a small
//! vote-based protocol suitable for exercising the simulator in tests.
//!
//! # Status
//!
//! `faultline-agreement` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod wire;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// Identifier of a simulated node (its index in the network).
pub type NodeId = u32;

/// Logical unit of simulated time.
pub type Tick = u64;

/// Agreement round (the height being decided).
pub type Round = u64;

/// Attempt within a round (incremented whenever a round times out).
pub type Period = u64;

/// Step within a period.
pub type Step = u8;

/// Step used by proposers.
pub const PROPOSE: Step = 0;

/// Step of the first vote on a proposal.
pub const SOFT: Step = 1;

/// Step of the vote that certifies a proposal.
pub const CERT: Step = 2;

/// Step of the vote cast when a period times out.
pub const NEXT: Step = 3;

/// Errors that can occur when decoding protocol messages.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("invalid step: {0}")]
    InvalidStep(Step),
    #[error("unexpected tag: {0}")]
    UnexpectedTag(Tag),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

/// Kind of a protocol message.
///
/// The two-letter codes are what declarative configuration (and logs) use to name a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tag {
    /// A vote on a proposal (`AV`).
    Vote,
    /// A proposed value (`PP`).
    Proposal,
    /// A certificate of cert votes for a round (`VB`).
    Bundle,
}

impl Tag {
    /// All known tags.
    pub const ALL: [Tag; 3] = [Tag::Vote, Tag::Proposal, Tag::Bundle];

    /// Two-letter code of the tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vote => "AV",
            Self::Proposal => "PP",
            Self::Bundle => "VB",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| Error::UnknownTag(s.to_string()))
    }
}

impl TryFrom<String> for Tag {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.as_str().to_string()
    }
}

/// Set of recipients of an outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients {
    /// Every other node in the network.
    All,
    /// A specific set of nodes.
    Some(Vec<NodeId>),
    /// A single node.
    One(NodeId),
}

/// A message a [Participant] asks the transport to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Where to send the message.
    pub recipients: Recipients,
    /// Kind of the message.
    pub tag: Tag,
    /// Encoded message.
    pub payload: Bytes,
    /// Node that created the payload, if it was not the sender.
    ///
    /// Set when re-broadcasting (regossiping) a message received from someone else.
    pub origin: Option<NodeId>,
}

impl Outbound {
    /// Broadcast a message created by the sender.
    pub fn broadcast(tag: Tag, payload: Bytes) -> Self {
        Self {
            recipients: Recipients::All,
            tag,
            payload,
            origin: None,
        }
    }

    /// Re-broadcast a message that was created by `origin`.
    pub fn relay(origin: NodeId, tag: Tag, payload: Bytes) -> Self {
        Self {
            recipients: Recipients::All,
            tag,
            payload,
            origin: Some(origin),
        }
    }

    /// Restrict the recipients of the message.
    pub fn to(mut self, recipients: Recipients) -> Self {
        self.recipients = recipients;
        self
    }
}

/// Position of a participant in the protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status {
    pub round: Round,
    pub period: Period,
    pub step: Step,
}

/// Identity handed to a [Builder] when constructing the participant of a node.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Index of the node.
    pub id: NodeId,
    /// Whether the node holds stake (and thus proposes and votes).
    ///
    /// Offline nodes still process and relay traffic.
    pub online: bool,
    /// Every node that holds stake, in ascending order.
    pub voters: Vec<NodeId>,
}

/// A running instance of an agreement protocol.
///
/// The simulator drives a participant one tick at a time: every message delivered during a
/// tick is handed to [Participant::receive], after which [Participant::tick] is called once.
/// All returned messages are sent on behalf of the participant.
pub trait Participant: Send + 'static {
    /// Process a message received from `source`.
    fn receive(&mut self, tick: Tick, source: NodeId, tag: Tag, payload: Bytes) -> Vec<Outbound>;

    /// Advance local timers to `tick`.
    fn tick(&mut self, tick: Tick) -> Vec<Outbound>;

    /// Current round.
    fn round(&self) -> Round;

    /// Current period.
    fn period(&self) -> Period;

    /// Current step.
    fn step(&self) -> Step;

    /// Round, period, and step at once.
    fn status(&self) -> Status {
        Status {
            round: self.round(),
            period: self.period(),
            step: self.step(),
        }
    }
}

/// Constructs one [Participant] per simulated node.
pub trait Builder: Send + Sync + 'static {
    /// Create the participant for `identity`.
    fn build(&self, identity: Identity) -> Box<dyn Participant>;
}
