//! Restrict which nodes may talk to each other.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::trace;

pub const NAME: &str = "TopologyFilter";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct Options {
    #[serde(default)]
    nodes_connection: BTreeMap<NodeId, Vec<NodeId>>,
}

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let options: Options = super::options(value, NAME)?;
    Some(Arc::new(Topology::new(options.nodes_connection)))
}

/// Directed adjacency between nodes.
///
/// A node may only send to the nodes listed under its own entry (and to itself). A node without
/// an entry (or with an empty one) is isolated.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    edges: Arc<BTreeMap<NodeId, BTreeSet<NodeId>>>,
}

impl Topology {
    pub fn new(edges: BTreeMap<NodeId, Vec<NodeId>>) -> Self {
        let edges = edges
            .into_iter()
            .map(|(node, peers)| (node, peers.into_iter().collect()))
            .collect();
        Self {
            edges: Arc::new(edges),
        }
    }

    /// Every node may send to its successor and predecessor (modulo `nodes`).
    pub fn circular(nodes: u32) -> Self {
        let mut edges = BTreeMap::new();
        for node in 0..nodes {
            let next = (node + 1) % nodes;
            let previous = (node + nodes - 1) % nodes;
            edges.insert(node, vec![next, previous]);
        }
        Self::new(edges)
    }

    /// Connect `relays` relays to `k` random relays each, and every other node to `k` random
    /// relays. All connections are bidirectional.
    pub fn relays(relays: u32, nodes: u32, k: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let k = k.min(relays as usize);
        let mut edges: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let connect = |edges: &mut BTreeMap<NodeId, Vec<NodeId>>, node: NodeId, peers: &[NodeId]| {
            edges.entry(node).or_default().extend_from_slice(peers);
            for peer in peers {
                edges.entry(*peer).or_default().push(node);
            }
        };
        for relay in 0..relays {
            // Pick among the other relays.
            let mut others: Vec<NodeId> = (0..relays).filter(|other| *other != relay).collect();
            others.shuffle(&mut rng);
            others.truncate(k);
            connect(&mut edges, relay, &others);
        }
        for node in relays..relays + nodes {
            let mut picked: Vec<NodeId> = (0..relays).collect();
            picked.shuffle(&mut rng);
            picked.truncate(k);
            connect(&mut edges, node, &picked);
        }
        Self::new(edges)
    }

    /// Whether `source` may send to `destination`.
    pub fn connected(&self, source: NodeId, destination: NodeId) -> bool {
        source == destination
            || self
                .edges
                .get(&source)
                .is_some_and(|peers| peers.contains(&destination))
    }

    /// Peers `node` may send to.
    pub fn peers(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges
            .get(&node)
            .into_iter()
            .flat_map(|peers| peers.iter().copied())
    }
}

impl Factory for Topology {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for (node, peers) in self.edges.iter() {
            context.check(*node)?;
            for peer in peers {
                context.check(*peer)?;
            }
        }
        Ok(Box::new(Edges {
            node: context.node,
            topology: self.clone(),
        }))
    }
}

struct Edges {
    node: NodeId,
    topology: Topology,
}

impl Filter for Edges {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        if !self.topology.connected(self.node, message.destination) {
            trace!(
                source = self.node,
                destination = message.destination,
                reason = "no link",
                "dropping message"
            );
            return Verdict::drop();
        }
        Verdict::pass(message)
    }
}
