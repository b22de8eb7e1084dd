//! Throttle the bytes a node sends or receives per tick.

use super::{Context, Direction, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tracing::trace;

pub const NAME: &str = "BandwidthFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let bandwidth: Bandwidth = super::options(value, NAME)?;
    Some(Arc::new(bandwidth))
}

/// Limit the bytes per second each listed node may send (`Upstream`) or receive (`Downstream`).
///
/// Messages over budget wait in arrival order and are released as budget accrues on later ticks.
/// A message larger than a tick's budget waits until enough budget has accrued for it.
///
/// Limits below the traffic a protocol generates make the backlog grow for as long as the
/// filter is active. `MaxBacklog` caps the bytes waiting per node and direction: messages that
/// would exceed it are shed.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Bandwidth {
    #[serde(default)]
    pub upstream: BTreeMap<NodeId, u64>,
    #[serde(default)]
    pub downstream: BTreeMap<NodeId, u64>,
    #[serde(default)]
    pub max_backlog: Option<u64>,
}

impl Factory for Bandwidth {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for (node, rate) in self.upstream.iter().chain(self.downstream.iter()) {
            context.check(*node)?;
            if *rate == 0 {
                return Err(Error::InvalidOption("bandwidth must be positive"));
            }
        }
        let bucket = |limits: &BTreeMap<NodeId, u64>| {
            limits.get(&context.node).map(|rate| {
                Bucket::new(*rate, context.tick_granularity, self.max_backlog)
            })
        };
        Ok(Box::new(Throttle {
            node: context.node,
            upstream: bucket(&self.upstream),
            downstream: bucket(&self.downstream),
        }))
    }
}

/// What a [Bucket] did with a message.
enum Admission {
    Sent(Message),
    Queued,
    Shed,
}

struct Bucket {
    per_tick: u64,
    tokens: u64,
    max_backlog: Option<u64>,
    backlog: u64,
    queue: VecDeque<Message>,
}

impl Bucket {
    fn new(rate: u64, tick_granularity: Duration, max_backlog: Option<u64>) -> Self {
        let per_tick = (u128::from(rate) * tick_granularity.as_nanos()
            / Duration::from_secs(1).as_nanos()) as u64;
        let per_tick = per_tick.max(1);
        Self {
            per_tick,
            tokens: per_tick,
            max_backlog,
            backlog: 0,
            queue: VecDeque::new(),
        }
    }

    fn admit(&mut self, message: Message) -> Admission {
        let size = message.size() as u64;
        if self.queue.is_empty() && self.tokens >= size {
            self.tokens -= size;
            return Admission::Sent(message);
        }
        let backlog = self.backlog.saturating_add(size);
        if self.max_backlog.is_some_and(|max| backlog > max) {
            return Admission::Shed;
        }
        self.backlog = backlog;
        self.queue.push_back(message);
        Admission::Queued
    }

    fn refill(&mut self) -> Vec<Message> {
        let front = self
            .queue
            .front()
            .map_or(0, |message| message.size() as u64);
        let cap = self.per_tick.max(front);
        self.tokens = self.tokens.saturating_add(self.per_tick).min(cap);

        let mut released = Vec::new();
        while let Some(message) = self.queue.front() {
            let size = message.size() as u64;
            if size > self.tokens {
                break;
            }
            self.tokens -= size;
            self.backlog -= size;
            if let Some(message) = self.queue.pop_front() {
                released.push(message);
            }
        }
        released
    }
}

struct Throttle {
    node: NodeId,
    upstream: Option<Bucket>,
    downstream: Option<Bucket>,
}

impl Throttle {
    fn admit(&mut self, direction: Direction, message: Message) -> Verdict {
        let bucket = match direction {
            Direction::Outgoing => self.upstream.as_mut(),
            Direction::Incoming => self.downstream.as_mut(),
        };
        let Some(bucket) = bucket else {
            return Verdict::pass(message);
        };
        match bucket.admit(message) {
            Admission::Sent(message) => Verdict::pass(message),
            Admission::Queued => {
                trace!(
                    node = self.node,
                    ?direction,
                    queued = bucket.queue.len(),
                    "throttling message"
                );
                Verdict::drop()
            }
            Admission::Shed => {
                trace!(
                    node = self.node,
                    ?direction,
                    backlog = bucket.backlog,
                    reason = "backlog full",
                    "dropping message"
                );
                Verdict::drop()
            }
        }
    }
}

impl Filter for Throttle {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.admit(Direction::Outgoing, message)
    }

    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.admit(Direction::Incoming, message)
    }

    fn on_tick(&mut self, _tick: Tick) -> Vec<(Direction, Message)> {
        let mut released = Vec::new();
        if let Some(bucket) = &mut self.upstream {
            released.extend(
                bucket
                    .refill()
                    .into_iter()
                    .map(|message| (Direction::Outgoing, message)),
            );
        }
        if let Some(bucket) = &mut self.downstream {
            released.extend(
                bucket
                    .refill()
                    .into_iter()
                    .map(|message| (Direction::Incoming, message)),
            );
        }
        released
    }
}
