//! Take over a node's regossip duty.
//!
//! Participants re-broadcast every fresh message they receive. This filter suppresses those
//! re-broadcasts and instead re-broadcasts, on the node's behalf, only the received messages
//! whose tag is configured. With no tags configured, the node never regossips.

use super::{duplicate::DEFAULT_RETENTION_TICKS, Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{wire::Digest, NodeId, Tag, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tracing::trace;

pub const NAME: &str = "MessageRegossipFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let regossip: Regossip = super::options(value, NAME)?;
    Some(Arc::new(regossip))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Regossip {
    /// Tags the filter re-broadcasts itself.
    #[serde(default)]
    pub regossip_tags: BTreeSet<Tag>,
    /// Ticks a re-broadcast digest is remembered for.
    #[serde(default = "default_retention_ticks")]
    pub retention_ticks: Tick,
}

fn default_retention_ticks() -> Tick {
    DEFAULT_RETENTION_TICKS
}

impl Default for Regossip {
    fn default() -> Self {
        Self {
            regossip_tags: BTreeSet::new(),
            retention_ticks: DEFAULT_RETENTION_TICKS,
        }
    }
}

impl Factory for Regossip {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        Ok(Box::new(self.gossip(context)))
    }
}

impl Regossip {
    fn gossip(&self, context: &Context) -> Gossip {
        Gossip {
            node: context.node,
            nodes: context.nodes,
            tags: self.regossip_tags.clone(),
            retention: self.retention_ticks,
            relayed: HashMap::new(),
            emitted: HashMap::new(),
            expiries: BTreeMap::new(),
        }
    }
}

struct Gossip {
    node: NodeId,
    nodes: u32,
    tags: BTreeSet<Tag>,
    retention: Tick,

    /// Digests already re-broadcast, with the tick they are forgotten at.
    relayed: HashMap<Digest, Tick>,
    /// Destinations of copies emitted by the filter that have yet to leave the node.
    emitted: HashMap<Digest, BTreeSet<NodeId>>,
    expiries: BTreeMap<Tick, Vec<Digest>>,
}

impl Gossip {
    fn prune(&mut self, tick: Tick) {
        while let Some(entry) = self.expiries.first_entry() {
            if *entry.key() > tick {
                break;
            }
            for digest in entry.remove() {
                self.relayed.remove(&digest);
                self.emitted.remove(&digest);
            }
        }
    }

    /// Whether `message` is a copy emitted by the filter (forgetting it if so).
    fn take_emitted(&mut self, message: &Message) -> bool {
        let digest = message.digest();
        let Some(destinations) = self.emitted.get_mut(&digest) else {
            return false;
        };
        let emitted = destinations.remove(&message.destination);
        if destinations.is_empty() {
            self.emitted.remove(&digest);
        }
        emitted
    }

    /// Number of digests the filter remembers.
    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.relayed.len() + self.emitted.len()
    }
}

impl Filter for Gossip {
    fn on_send(&mut self, tick: Tick, message: Message) -> Verdict {
        self.prune(tick);
        if message.origin == self.node || self.take_emitted(&message) {
            return Verdict::pass(message);
        }
        trace!(
            node = self.node,
            origin = message.origin,
            destination = message.destination,
            reason = "regossip",
            "dropping message"
        );
        Verdict::drop()
    }

    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        self.prune(tick);
        if !self.tags.contains(&message.tag) {
            return Verdict::pass(message);
        }
        let digest = message.digest();
        if self.relayed.contains_key(&digest) {
            return Verdict::pass(message);
        }
        let expiry = tick.saturating_add(self.retention);
        self.relayed.insert(digest, expiry);
        self.expiries.entry(expiry).or_default().push(digest);

        let mut copies = Vec::new();
        let mut destinations = BTreeSet::new();
        for destination in 0..self.nodes {
            if destination == self.node || destination == message.source {
                continue;
            }
            destinations.insert(destination);
            copies.push(message.forward(self.node, destination));
        }
        if !destinations.is_empty() {
            self.emitted.insert(digest, destinations);
        }
        Verdict::extend(message, copies)
    }
}
