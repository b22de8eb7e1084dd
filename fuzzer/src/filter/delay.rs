//! Hold messages for a configured number of ticks.

use super::{select, Context, Direction, Factory, Filter, Selector, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::trace;

pub const NAME: &str = "MessageDelayFilter";

/// Ticks of delay per tag, per node.
pub type Delays = BTreeMap<NodeId, BTreeMap<Selector, Tick>>;

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let delay: Delay = super::options(value, NAME)?;
    Some(Arc::new(delay))
}

/// Delay messages sent (`Outgoing`, keyed by sender) or received (`Incoming`, keyed by
/// recipient).
///
/// A message delayed by `n` ticks is delivered `n` ticks later than it would have been.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Delay {
    #[serde(default)]
    pub outgoing: Delays,
    #[serde(default)]
    pub incoming: Delays,
}

impl Factory for Delay {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for node in self.outgoing.keys().chain(self.incoming.keys()) {
            context.check(*node)?;
        }
        Ok(Box::new(Hold {
            node: context.node,
            outgoing: self.outgoing.get(&context.node).cloned().unwrap_or_default(),
            incoming: self.incoming.get(&context.node).cloned().unwrap_or_default(),
            held: BTreeMap::new(),
        }))
    }
}

struct Hold {
    node: NodeId,
    outgoing: BTreeMap<Selector, Tick>,
    incoming: BTreeMap<Selector, Tick>,
    held: BTreeMap<Tick, Vec<(Direction, Message)>>,
}

impl Hold {
    fn hold(&mut self, tick: Tick, direction: Direction, message: Message) -> Verdict {
        let options = match direction {
            Direction::Outgoing => &self.outgoing,
            Direction::Incoming => &self.incoming,
        };
        let delay = select(options, message.tag).copied().unwrap_or_default();
        if delay == 0 {
            return Verdict::pass(message);
        }
        trace!(node = self.node, tag = %message.tag, delay, "holding message");
        self.held
            .entry(tick.saturating_add(delay))
            .or_default()
            .push((direction, message));
        Verdict::drop()
    }
}

impl Filter for Hold {
    fn on_send(&mut self, tick: Tick, message: Message) -> Verdict {
        self.hold(tick, Direction::Outgoing, message)
    }

    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        self.hold(tick, Direction::Incoming, message)
    }

    fn on_tick(&mut self, tick: Tick) -> Vec<(Direction, Message)> {
        let pending = self.held.split_off(&tick.saturating_add(1));
        let due = std::mem::replace(&mut self.held, pending);
        due.into_values().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::mocks::context, mocks::message};
    use faultline_agreement::Tag;
    use serde_json::json;

    #[test]
    fn test_holds_until_due() {
        let registry = super::super::Registry::default();
        let factory = registry
            .parse(&json!({
                "Name": NAME,
                "Outgoing": {"0": {"*": 2, "VB": 0}},
                "Incoming": {"0": {"AV": 1}},
            }))
            .unwrap();
        let mut filter = factory.create(&context(0, 2)).unwrap();

        assert!(!filter.on_send(5, message(0, 1, Tag::Vote, b"a")).forward);
        assert!(filter.on_send(5, message(0, 1, Tag::Bundle, b"b")).forward);
        assert!(!filter.on_receive(5, message(1, 0, Tag::Vote, b"c")).forward);
        assert!(filter.on_receive(5, message(1, 0, Tag::Proposal, b"d")).forward);

        assert!(filter.on_tick(5).is_empty());
        let released = filter.on_tick(6);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, Direction::Incoming);
        let released = filter.on_tick(7);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, Direction::Outgoing);
        assert_eq!(released[0].1.payload.as_ref(), b"a");
        assert!(filter.on_tick(8).is_empty());
    }

    #[test]
    fn test_other_nodes_untouched() {
        let delay = Delay {
            outgoing: BTreeMap::from([(0, BTreeMap::from([(Selector::Any, 3)]))]),
            incoming: BTreeMap::new(),
        };
        let mut filter = delay.create(&context(1, 2)).unwrap();
        assert!(filter.on_send(1, message(1, 0, Tag::Vote, b"a")).forward);

        let unknown = Delay {
            incoming: BTreeMap::from([(5, BTreeMap::new())]),
            ..delay
        };
        assert!(matches!(
            unknown.create(&context(0, 2)),
            Err(Error::UnknownNode(5))
        ));
    }
}
