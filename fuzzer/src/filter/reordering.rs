//! Shuffle the order in which messages leave or reach a node.

use super::{Context, Direction, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::trace;

pub const NAME: &str = "MessageReorderingFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let reordering: Reordering = super::options(value, NAME)?;
    Some(Arc::new(reordering))
}

/// Shuffle window of a node.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Shuffle {
    /// Messages buffered on the send path before they are released shuffled (0 disables).
    #[serde(default)]
    pub send_shuffle_size: usize,
    /// Messages buffered on the receive path before they are released shuffled (0 disables).
    #[serde(default)]
    pub receive_shuffle_size: usize,
    /// Longest a message may wait for its window to fill.
    #[serde(default)]
    pub max_retention_ticks: Tick,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Reordering {
    #[serde(default)]
    pub nodes_shuffle_config: BTreeMap<NodeId, Shuffle>,
}

impl Factory for Reordering {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for node in self.nodes_shuffle_config.keys() {
            context.check(*node)?;
        }
        let shuffle = self
            .nodes_shuffle_config
            .get(&context.node)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(Shuffler {
            node: context.node,
            rng: StdRng::seed_from_u64(context.seed ^ u64::from(context.node)),
            outgoing: Window::new(shuffle.send_shuffle_size, shuffle.max_retention_ticks),
            incoming: Window::new(shuffle.receive_shuffle_size, shuffle.max_retention_ticks),
        }))
    }
}

struct Window {
    size: usize,
    retention: Tick,
    buffer: Vec<Message>,
    oldest: Tick,
}

impl Window {
    fn new(size: usize, retention: Tick) -> Self {
        Self {
            size,
            retention,
            buffer: Vec::new(),
            oldest: 0,
        }
    }
}

struct Shuffler {
    node: NodeId,
    rng: StdRng,
    outgoing: Window,
    incoming: Window,
}

impl Shuffler {
    fn buffer(&mut self, tick: Tick, direction: Direction, message: Message) -> Verdict {
        let window = match direction {
            Direction::Outgoing => &mut self.outgoing,
            Direction::Incoming => &mut self.incoming,
        };
        if window.size <= 1 {
            return Verdict::pass(message);
        }
        if window.buffer.is_empty() {
            window.oldest = tick;
        }
        window.buffer.push(message);
        if window.buffer.len() < window.size {
            return Verdict::drop();
        }
        let mut released = std::mem::take(&mut window.buffer);
        released.shuffle(&mut self.rng);
        trace!(node = self.node, ?direction, count = released.len(), "releasing shuffled window");
        Verdict::replace(released)
    }

    fn flush(tick: Tick, direction: Direction, window: &mut Window) -> Vec<(Direction, Message)> {
        if window.buffer.is_empty() || tick.saturating_sub(window.oldest) <= window.retention {
            return Vec::new();
        }
        window
            .buffer
            .drain(..)
            .map(|message| (direction, message))
            .collect()
    }
}

impl Filter for Shuffler {
    fn on_send(&mut self, tick: Tick, message: Message) -> Verdict {
        self.buffer(tick, Direction::Outgoing, message)
    }

    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        self.buffer(tick, Direction::Incoming, message)
    }

    fn on_tick(&mut self, tick: Tick) -> Vec<(Direction, Message)> {
        let mut released = Self::flush(tick, Direction::Outgoing, &mut self.outgoing);
        released.extend(Self::flush(tick, Direction::Incoming, &mut self.incoming));
        released
    }
}
