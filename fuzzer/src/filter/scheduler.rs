//! Apply filters only during scheduled windows.

use super::{Chain, Context, Direction, Factory, Filter, Registry, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;

pub const NAME: &str = "SchedulerFilter";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct Options {
    #[serde(default)]
    filters: Vec<Value>,
    #[serde(default)]
    schedule: Vec<Entry>,
    #[serde(default)]
    schedule_name: String,
}

pub fn parse(value: &Value, registry: &Registry) -> Option<Arc<dyn Factory>> {
    let options: Options = super::options(value, NAME)?;
    let mut filters = Vec::with_capacity(options.filters.len());
    for filter in &options.filters {
        let Some(factory) = registry.parse(filter) else {
            debug!(schedule = %options.schedule_name, "unrecognized nested filter");
            return None;
        };
        filters.push(factory);
    }
    Some(Arc::new(Scheduler::new(
        options.schedule_name,
        filters,
        options.schedule,
    )))
}

/// When a schedule entry holds, relative to its bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Operation {
    /// `tick < first`
    #[default]
    Before,
    /// `tick > first`
    After,
    /// `first <= tick < second`
    Between,
    /// `tick < first || tick >= second`
    NotBetween,
    /// `tick >= first`
    NotBefore,
}

impl TryFrom<u8> for Operation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Before),
            1 => Ok(Self::After),
            2 => Ok(Self::Between),
            3 => Ok(Self::NotBetween),
            4 => Ok(Self::NotBefore),
            other => Err(format!("unknown schedule operation: {other}")),
        }
    }
}

/// A window of ticks during which the nested filters apply to `nodes`.
///
/// Each bound is given either in ticks or as a duration in milliseconds (converted with the tick
/// granularity). A tick bound takes precedence over a duration bound.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Entry {
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub first_tick: Option<Tick>,
    #[serde(default)]
    pub first_duration: Option<u64>,
    #[serde(default)]
    pub second_tick: Option<Tick>,
    #[serde(default)]
    pub second_duration: Option<u64>,
    #[serde(default)]
    pub nodes: Vec<NodeId>,
}

impl Entry {
    pub fn new(operation: Operation, first: Tick, nodes: Vec<NodeId>) -> Self {
        Self {
            operation,
            first_tick: Some(first),
            nodes,
            ..Default::default()
        }
    }

    /// Hold during `[first, second)`.
    pub fn between(first: Tick, second: Tick, nodes: Vec<NodeId>) -> Self {
        Self {
            second_tick: Some(second),
            ..Self::new(Operation::Between, first, nodes)
        }
    }

    fn window(&self, tick_granularity: Duration) -> Result<Window, Error> {
        let bound = |tick: Option<Tick>, millis: Option<u64>| {
            tick.or_else(|| {
                millis.map(|millis| {
                    super::ticks(Duration::from_millis(millis), tick_granularity)
                })
            })
        };
        let first = bound(self.first_tick, self.first_duration)
            .ok_or(Error::MissingBound("first"))?;
        let second = match self.operation {
            Operation::Between | Operation::NotBetween => {
                let second = bound(self.second_tick, self.second_duration)
                    .ok_or(Error::MissingBound("second"))?;
                if first >= second {
                    return Err(Error::InvalidSchedule(first, second));
                }
                second
            }
            _ => first,
        };
        Ok(Window {
            operation: self.operation,
            first,
            second,
        })
    }
}

/// An [Entry] with its bounds resolved to ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    operation: Operation,
    first: Tick,
    second: Tick,
}

impl Window {
    fn holds(&self, tick: Tick) -> bool {
        match self.operation {
            Operation::Before => tick < self.first,
            Operation::After => tick > self.first,
            Operation::Between => self.first <= tick && tick < self.second,
            Operation::NotBetween => tick < self.first || tick >= self.second,
            Operation::NotBefore => tick >= self.first,
        }
    }
}

/// Splice a chain of nested filters into a node's chain while one of the node's schedule
/// entries holds.
///
/// Nodes that appear in no entry get an empty nested chain. Nested filters are ticked on every
/// tick, so messages they retain are released even outside the schedule.
#[derive(Clone, Debug)]
pub struct Scheduler {
    name: String,
    filters: Vec<Arc<dyn Factory>>,
    schedule: Vec<Entry>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, filters: Vec<Arc<dyn Factory>>, schedule: Vec<Entry>) -> Self {
        Self {
            name: name.into(),
            filters,
            schedule,
        }
    }
}

impl Factory for Scheduler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        let mut windows = Vec::new();
        for entry in &self.schedule {
            let window = entry.window(context.tick_granularity)?;
            for node in &entry.nodes {
                context.check(*node)?;
            }
            if entry.nodes.contains(&context.node) {
                windows.push(window);
            }
        }
        let chain = if windows.is_empty() {
            Chain::default()
        } else {
            super::build(&self.filters, context)?
        };
        debug!(
            schedule = %self.name,
            node = context.node,
            windows = windows.len(),
            filters = chain.len(),
            "scheduled filters"
        );
        Ok(Box::new(Scheduled { windows, chain }))
    }

    fn report(&self, tick_granularity: Duration) -> Option<String> {
        let reports: Vec<_> = self
            .filters
            .iter()
            .filter_map(|filter| filter.report(tick_granularity))
            .collect();
        if reports.is_empty() {
            return None;
        }
        Some(reports.join("\n"))
    }
}

struct Scheduled {
    windows: Vec<Window>,
    chain: Chain,
}

impl Scheduled {
    fn active(&self, tick: Tick) -> bool {
        self.windows.iter().any(|window| window.holds(tick))
    }

    fn apply(&mut self, tick: Tick, direction: Direction, message: Message) -> Verdict {
        if !self.active(tick) {
            return Verdict::pass(message);
        }
        let messages = match direction {
            Direction::Outgoing => self.chain.send(tick, message.clone()),
            Direction::Incoming => self.chain.receive(tick, message.clone()),
        };
        Verdict {
            forward: messages.contains(&message),
            messages,
        }
    }
}

impl Filter for Scheduled {
    fn on_send(&mut self, tick: Tick, message: Message) -> Verdict {
        self.apply(tick, Direction::Outgoing, message)
    }

    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        self.apply(tick, Direction::Incoming, message)
    }

    fn on_tick(&mut self, tick: Tick) -> Vec<(Direction, Message)> {
        self.chain.tick(tick)
    }

    fn lift(&mut self) {
        self.chain.lift();
    }
}
