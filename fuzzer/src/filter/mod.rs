//! Composable message filters.
//!
//! Every node owns a [Chain] of filters. Messages a node sends traverse its chain through
//! [Filter::on_send] (in order) before reaching the destination, where they traverse the
//! destination's chain through [Filter::on_receive] before being delivered. A filter sees owned
//! messages and decides, through a [Verdict], which messages continue down the chain.
//!
//! Filters are constructed per node by a [Factory]. Factories are either built in code or parsed
//! from opaque JSON blobs (objects carrying a `Name` field) by a [Registry].

use crate::{Error, Message};
use faultline_agreement::{NodeId, Tag, Tick};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::debug;

pub mod bandwidth;
pub mod catchup;
pub mod decoder;
pub mod delay;
pub mod duplicate;
pub mod duplication;
pub mod reflection;
pub mod regossip;
pub mod reordering;
pub mod scheduler;
pub mod statistics;
pub mod topology;
pub mod vote;

/// Path a message is travelling through a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Leaving the node that owns the chain.
    Outgoing,
    /// Arriving at the node that owns the chain.
    Incoming,
}

/// Outcome of filtering a single message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the message handed to the filter continues down the chain.
    pub forward: bool,
    /// Every message that continues down the chain (including the original when
    /// `forward` is set).
    pub messages: Vec<Message>,
}

impl Verdict {
    /// Let the message through untouched.
    pub fn pass(message: Message) -> Self {
        Self {
            forward: true,
            messages: vec![message],
        }
    }

    /// Discard the message (or keep it for later release).
    pub fn drop() -> Self {
        Self {
            forward: false,
            messages: Vec::new(),
        }
    }

    /// Let the message through, followed by `extra`.
    pub fn extend(message: Message, extra: impl IntoIterator<Item = Message>) -> Self {
        let mut messages = vec![message];
        messages.extend(extra);
        Self {
            forward: true,
            messages,
        }
    }

    /// Discard the message in favor of `messages`.
    pub fn replace(messages: Vec<Message>) -> Self {
        Self {
            forward: false,
            messages,
        }
    }
}

/// A per-node message filter.
///
/// Every hook defaults to letting traffic through untouched.
pub trait Filter: Send + 'static {
    /// Inspect a message the owning node is sending.
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        Verdict::pass(message)
    }

    /// Inspect a message the owning node is receiving.
    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        Verdict::pass(message)
    }

    /// Release messages retained on earlier ticks.
    ///
    /// Released messages resume at the next filter of the chain, in the given direction.
    fn on_tick(&mut self, _tick: Tick) -> Vec<(Direction, Message)> {
        Vec::new()
    }

    /// Whether the filter only observes traffic.
    ///
    /// Passive filters keep running after faults are lifted.
    fn passive(&self) -> bool {
        false
    }

    /// Called when faults are lifted from the chain holding the filter.
    fn lift(&mut self) {}
}

/// What a [Factory] knows about the node it creates a filter for.
#[derive(Clone, Debug)]
pub struct Context {
    /// Node that will own the filter.
    pub node: NodeId,
    /// Number of nodes in the network.
    pub nodes: u32,
    /// Whether the node holds stake.
    pub online: bool,
    /// Wall-clock duration of a tick.
    pub tick_granularity: Duration,
    /// Seed of the simulation.
    pub seed: u64,
}

impl Context {
    /// Number of whole ticks in `duration`.
    pub fn ticks(&self, duration: Duration) -> Tick {
        ticks(duration, self.tick_granularity)
    }

    /// Return an error if `node` is not part of the network.
    pub fn check(&self, node: NodeId) -> Result<(), Error> {
        if node >= self.nodes {
            return Err(Error::UnknownNode(node));
        }
        Ok(())
    }
}

/// Number of whole ticks of `granularity` in `duration`.
pub fn ticks(duration: Duration, granularity: Duration) -> Tick {
    let granularity = granularity.as_nanos().max(1);
    (duration.as_nanos() / granularity) as Tick
}

/// Creates one [Filter] per node.
pub trait Factory: Send + Sync + 'static {
    /// Name the factory is registered under.
    fn name(&self) -> &'static str;

    /// Create the filter of the node described by `context`.
    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error>;

    /// Summary of what the created filters observed, logged at the end of a run.
    fn report(&self, _tick_granularity: Duration) -> Option<String> {
        None
    }
}

impl fmt::Debug for dyn Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build the chain of `context.node` from `factories` (in order).
pub fn build(factories: &[Arc<dyn Factory>], context: &Context) -> Result<Chain, Error> {
    let filters = factories
        .iter()
        .map(|factory| factory.create(context))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Chain::new(filters))
}

/// Ordered filters of a node.
///
/// Every message a filter lets through continues at the next filter. A message a filter
/// redirects (sent from another node, or received for another node) leaves the chain at once.
#[derive(Default)]
pub struct Chain {
    filters: Vec<Box<dyn Filter>>,
    lifted: bool,
}

impl Chain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            filters,
            lifted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Bypass every filter that is not passive from now on.
    ///
    /// Retained messages are still released.
    pub fn lift(&mut self) {
        self.lifted = true;
        for filter in &mut self.filters {
            filter.lift();
        }
    }

    /// Run a message sent by the owning node through the chain.
    pub fn send(&mut self, tick: Tick, message: Message) -> Vec<Message> {
        self.run(tick, Direction::Outgoing, 0, message)
    }

    /// Run a message received by the owning node through the chain.
    pub fn receive(&mut self, tick: Tick, message: Message) -> Vec<Message> {
        self.run(tick, Direction::Incoming, 0, message)
    }

    /// Release retained messages and run them through the rest of the chain.
    pub fn tick(&mut self, tick: Tick) -> Vec<(Direction, Message)> {
        let mut released = Vec::new();
        for index in 0..self.filters.len() {
            for (direction, message) in self.filters[index].on_tick(tick) {
                for message in self.run(tick, direction, index + 1, message) {
                    released.push((direction, message));
                }
            }
        }
        released
    }

    /// Node on whose behalf a message travels in `direction`.
    fn owner(direction: Direction, message: &Message) -> NodeId {
        match direction {
            Direction::Outgoing => message.source,
            Direction::Incoming => message.destination,
        }
    }

    fn run(
        &mut self,
        tick: Tick,
        direction: Direction,
        start: usize,
        message: Message,
    ) -> Vec<Message> {
        let owner = Self::owner(direction, &message);
        let mut output = Vec::new();
        let mut pending = vec![(start, message)];
        while let Some((index, message)) = pending.pop() {
            // Redirected messages leave the chain.
            if Self::owner(direction, &message) != owner {
                output.push(message);
                continue;
            }
            let next = self.filters[index.min(self.filters.len())..]
                .iter()
                .position(|filter| !self.lifted || filter.passive())
                .map(|offset| index + offset);
            let Some(next) = next else {
                output.push(message);
                continue;
            };
            let filter = &mut self.filters[next];
            let verdict = match direction {
                Direction::Outgoing => filter.on_send(tick, message),
                Direction::Incoming => filter.on_receive(tick, message),
            };

            // Preserve the order of the verdict.
            for message in verdict.messages.into_iter().rev() {
                pending.push((next + 1, message));
            }
        }
        output
    }
}

/// Selects the tags a filter option applies to.
///
/// `"*"` matches every tag that is not listed explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Selector {
    Any,
    Tag(Tag),
}

impl TryFrom<String> for Selector {
    type Error = faultline_agreement::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "*" {
            return Ok(Self::Any);
        }
        value.parse().map(Self::Tag)
    }
}

/// Option of `tag` in `options`, falling back to the `"*"` entry.
pub fn select<T>(options: &BTreeMap<Selector, T>, tag: Tag) -> Option<&T> {
    options
        .get(&Selector::Tag(tag))
        .or_else(|| options.get(&Selector::Any))
}

/// Parses a JSON blob into a [Factory], or returns `None` if the blob is not its own.
pub type Parser = fn(&Value, &Registry) -> Option<Arc<dyn Factory>>;

/// Table of the filters that can be built from declarative configuration.
pub struct Registry {
    parsers: Vec<(&'static str, Parser)>,
}

impl Registry {
    /// Create a registry that recognizes nothing.
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Recognize blobs named `name` with `parser`.
    ///
    /// Parsers are consulted in registration order.
    pub fn register(&mut self, name: &'static str, parser: Parser) {
        self.parsers.push((name, parser));
    }

    /// Names of all registered filters.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parsers.iter().map(|(name, _)| *name)
    }

    /// Offer `value` to every registered parser until one claims it.
    pub fn parse(&self, value: &Value) -> Option<Arc<dyn Factory>> {
        self.parsers.iter().find_map(|(_, parser)| parser(value, self))
    }

    /// Parse every blob of `values`, failing on the first one nobody claims.
    pub fn parse_all(&self, values: &[Value]) -> Result<Vec<Arc<dyn Factory>>, Error> {
        values
            .iter()
            .map(|value| {
                self.parse(value).ok_or_else(|| {
                    let name = value
                        .get("Name")
                        .and_then(Value::as_str)
                        .unwrap_or("<unnamed>");
                    Error::UnrecognizedFilter(name.to_string())
                })
            })
            .collect()
    }
}

impl Default for Registry {
    /// Create a registry that recognizes every built-in filter.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(topology::NAME, topology::parse);
        registry.register(duplicate::NAME, duplicate::parse);
        registry.register(regossip::NAME, regossip::parse);
        registry.register(delay::NAME, delay::parse);
        registry.register(duplication::NAME, duplication::parse);
        registry.register(reordering::NAME, reordering::parse);
        registry.register(reflection::NAME, reflection::parse);
        registry.register(decoder::NAME, decoder::parse);
        registry.register(catchup::NAME, catchup::parse);
        registry.register(vote::NAME, vote::parse);
        registry.register(statistics::NAME, statistics::parse);
        registry.register(scheduler::NAME, scheduler::parse);
        registry.register(bandwidth::NAME, bandwidth::parse);
        registry
    }
}

/// Deserialize the options of the filter called `name` from `value`.
///
/// Returns `None` if `value` is not named `name` or carries options the filter does not accept.
pub(crate) fn options<T: DeserializeOwned>(value: &Value, name: &'static str) -> Option<T> {
    let object = value.as_object()?;
    if object.get("Name")?.as_str()? != name {
        return None;
    }
    let mut fields = object.clone();
    fields.remove("Name");
    match serde_json::from_value(Value::Object(fields)) {
        Ok(options) => Some(options),
        Err(err) => {
            debug!(name, ?err, "rejecting filter options");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every message it sees and lets it through.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub seen: Arc<Mutex<Vec<(Direction, Message)>>>,
        pub passive: bool,
    }

    impl Filter for Recorder {
        fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
            self.seen
                .lock()
                .unwrap()
                .push((Direction::Outgoing, message.clone()));
            Verdict::pass(message)
        }

        fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
            self.seen
                .lock()
                .unwrap()
                .push((Direction::Incoming, message.clone()));
            Verdict::pass(message)
        }

        fn passive(&self) -> bool {
            self.passive
        }
    }

    /// Creates one filter per node from a closure.
    pub struct FnFactory<F>(pub F);

    impl<F> Factory for FnFactory<F>
    where
        F: Fn(&Context) -> Box<dyn Filter> + Send + Sync + 'static,
    {
        fn name(&self) -> &'static str {
            "FnFactory"
        }

        fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
            Ok((self.0)(context))
        }
    }

    pub fn context(node: NodeId, nodes: u32) -> Context {
        Context {
            node,
            nodes,
            online: true,
            tick_granularity: Duration::from_millis(100),
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mocks::Recorder, *};
    use crate::mocks::message;
    use serde_json::json;

    /// Emits two copies of every outgoing message.
    struct Doubler;

    impl Filter for Doubler {
        fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
            let copy = message.clone();
            Verdict::extend(message, [copy])
        }
    }

    /// Drops everything.
    struct Sink;

    impl Filter for Sink {
        fn on_send(&mut self, _tick: Tick, _message: Message) -> Verdict {
            Verdict::drop()
        }

        fn on_receive(&mut self, _tick: Tick, _message: Message) -> Verdict {
            Verdict::drop()
        }
    }

    #[test]
    fn test_pass_through_round_trip() {
        let mut filters: Vec<Box<dyn Filter>> = Vec::new();
        let recorders: Vec<_> = (0..3).map(|_| Recorder::default()).collect();
        for recorder in &recorders {
            filters.push(Box::new(recorder.clone()));
        }
        let mut chain = Chain::new(filters);

        let original = message(0, 1, Tag::Vote, b"payload");
        let mut recorder = Recorder::default();
        let verdict = recorder.on_send(1, original.clone());
        assert!(verdict.forward);
        assert_eq!(verdict.messages, vec![original.clone()]);

        let sent = chain.send(1, original.clone());
        assert_eq!(sent, vec![original.clone()]);
        let received = chain.receive(1, original.clone());
        assert_eq!(received, vec![original.clone()]);
        for recorder in recorders {
            let seen = recorder.seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0], (Direction::Outgoing, original.clone()));
            assert_eq!(seen[1], (Direction::Incoming, original.clone()));
        }
    }

    #[test]
    fn test_copies_continue_through_chain() {
        let recorder = Recorder::default();
        let mut chain = Chain::new(vec![Box::new(Doubler), Box::new(recorder.clone())]);
        let sent = chain.send(3, message(0, 1, Tag::Proposal, b"p"));
        assert_eq!(sent.len(), 2);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_lifted_chain_skips_active_filters() {
        let recorder = Recorder {
            passive: true,
            ..Default::default()
        };
        let mut chain = Chain::new(vec![Box::new(Sink), Box::new(recorder.clone())]);
        assert!(chain.send(1, message(0, 1, Tag::Vote, b"v")).is_empty());
        assert!(recorder.seen.lock().unwrap().is_empty());

        chain.lift();
        assert_eq!(chain.receive(2, message(1, 0, Tag::Vote, b"v")).len(), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_selector() {
        let options: BTreeMap<Selector, u64> =
            serde_json::from_value(json!({"*": 1, "AV": 5})).unwrap();
        assert_eq!(select(&options, Tag::Vote), Some(&5));
        assert_eq!(select(&options, Tag::Bundle), Some(&1));
        assert!(serde_json::from_value::<BTreeMap<Selector, u64>>(json!({"ZZ": 1})).is_err());
    }

    #[test]
    fn test_registry() {
        let registry = Registry::default();
        assert_eq!(registry.names().count(), 13);

        let factory = registry
            .parse(&json!({"Name": "DuplicateMessageFilter"}))
            .unwrap();
        assert_eq!(factory.name(), duplicate::NAME);

        // Unknown names and unknown options are not claimed.
        assert!(registry.parse(&json!({"Name": "MysteryFilter"})).is_none());
        assert!(registry
            .parse(&json!({"Name": "DuplicateMessageFilter", "Bogus": 1}))
            .is_none());
        assert!(registry.parse(&json!(["not", "an", "object"])).is_none());

        let err = registry
            .parse_all(&[json!({"Name": "TopologyFilter"}), json!({"Name": "MysteryFilter"})])
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFilter(name) if name == "MysteryFilter"));
    }

    #[test]
    fn test_ticks() {
        let context = mocks::context(0, 1);
        assert_eq!(context.ticks(Duration::from_millis(250)), 2);
        assert_eq!(context.ticks(Duration::ZERO), 0);
        assert!(context.check(0).is_ok());
        assert!(matches!(context.check(1), Err(Error::UnknownNode(1))));
    }
}
