//! Count traffic per node.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{Arc, RwLock},
    time::Duration,
};

pub const NAME: &str = "TrafficStatisticsFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let options: Options = super::options(value, NAME)?;
    Some(Arc::new(Statistics::new(options.output_format)))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct Options {
    #[serde(default)]
    output_format: Format,
}

/// Report produced at the end of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Format {
    /// No report.
    #[default]
    None,
    /// Totals across all nodes.
    Summary,
    /// Totals per node.
    Nodes,
}

impl TryFrom<u8> for Format {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Summary),
            2 => Ok(Self::Nodes),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Traffic observed during a single tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub tick: Tick,
    pub messages: u64,
    pub bytes: u64,
}

/// Traffic in one direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Per-tick samples, in tick order (ticks without traffic are omitted).
    pub series: Vec<Sample>,
    pub messages: u64,
    pub bytes: u64,
}

impl Traffic {
    fn record(&mut self, tick: Tick, bytes: usize) {
        let bytes = bytes as u64;
        self.messages += 1;
        self.bytes += bytes;
        match self.series.last_mut() {
            Some(sample) if sample.tick == tick => {
                sample.messages += 1;
                sample.bytes += bytes;
            }
            _ => self.series.push(Sample {
                tick,
                messages: 1,
                bytes,
            }),
        }
    }

    /// Most bytes observed in a single tick.
    pub fn peak_bytes(&self) -> u64 {
        self.series
            .iter()
            .map(|sample| sample.bytes)
            .max()
            .unwrap_or_default()
    }
}

/// Traffic of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTraffic {
    pub outgoing: Traffic,
    pub incoming: Traffic,
}

/// Convert `bytes` per tick to bytes per second.
pub fn rate(bytes: u64, tick_granularity: Duration) -> u64 {
    let granularity = tick_granularity.as_nanos().max(1);
    (u128::from(bytes) * Duration::from_secs(1).as_nanos() / granularity) as u64
}

/// Record every message each node sends and receives.
///
/// Clones share the same counters, so a handle kept by the caller observes the traffic of every
/// filter created from it.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    format: Format,
    nodes: Arc<RwLock<BTreeMap<NodeId, NodeTraffic>>>,
}

impl Statistics {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            nodes: Arc::default(),
        }
    }

    /// Traffic of `node`, if it was created.
    pub fn traffic(&self, node: NodeId) -> Option<NodeTraffic> {
        self.nodes.read().unwrap().get(&node).cloned()
    }

    /// Traffic of every node.
    pub fn snapshot(&self) -> BTreeMap<NodeId, NodeTraffic> {
        self.nodes.read().unwrap().clone()
    }

    /// Messages sent by all nodes.
    pub fn total_sent(&self) -> u64 {
        self.nodes
            .read()
            .unwrap()
            .values()
            .map(|traffic| traffic.outgoing.messages)
            .sum()
    }
}

impl Factory for Statistics {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        self.nodes.write().unwrap().entry(context.node).or_default();
        Ok(Box::new(Counter {
            node: context.node,
            nodes: self.nodes.clone(),
        }))
    }

    fn report(&self, tick_granularity: Duration) -> Option<String> {
        let nodes = self.nodes.read().unwrap();
        let mut report = String::new();
        match self.format {
            Format::None => return None,
            Format::Summary => {
                let (mut messages, mut bytes, mut peak) = (0, 0, 0);
                for traffic in nodes.values() {
                    messages += traffic.outgoing.messages;
                    bytes += traffic.outgoing.bytes;
                    peak = peak.max(traffic.outgoing.peak_bytes());
                }
                let _ = write!(
                    report,
                    "nodes={} sent_messages={messages} sent_bytes={bytes} peak_rate={}B/s",
                    nodes.len(),
                    rate(peak, tick_granularity)
                );
            }
            Format::Nodes => {
                for (node, traffic) in nodes.iter() {
                    let _ = writeln!(
                        report,
                        "node={node} sent_messages={} sent_bytes={} received_messages={} received_bytes={} peak_rate={}B/s",
                        traffic.outgoing.messages,
                        traffic.outgoing.bytes,
                        traffic.incoming.messages,
                        traffic.incoming.bytes,
                        rate(traffic.outgoing.peak_bytes(), tick_granularity)
                    );
                }
            }
        }
        Some(report)
    }
}

struct Counter {
    node: NodeId,
    nodes: Arc<RwLock<BTreeMap<NodeId, NodeTraffic>>>,
}

impl Filter for Counter {
    fn on_send(&mut self, tick: Tick, message: Message) -> Verdict {
        let mut nodes = self.nodes.write().unwrap();
        let traffic = nodes.entry(self.node).or_default();
        traffic.outgoing.record(tick, message.size());
        Verdict::pass(message)
    }

    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        let mut nodes = self.nodes.write().unwrap();
        let traffic = nodes.entry(self.node).or_default();
        traffic.incoming.record(tick, message.size());
        Verdict::pass(message)
    }

    fn passive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::mocks::context, mocks::message};
    use faultline_agreement::Tag;
    use serde_json::json;

    #[test]
    fn test_series_and_totals() {
        let statistics = Statistics::new(Format::Nodes);
        let mut zero = statistics.create(&context(0, 2)).unwrap();
        let mut one = statistics.create(&context(1, 2)).unwrap();
        assert!(zero.passive());

        zero.on_send(1, message(0, 1, Tag::Vote, b"abcd"));
        zero.on_send(1, message(0, 1, Tag::Vote, b"ef"));
        zero.on_send(3, message(0, 1, Tag::Vote, b"g"));
        one.on_receive(2, message(0, 1, Tag::Vote, b"abcd"));

        let traffic = statistics.traffic(0).unwrap();
        assert_eq!(
            traffic.outgoing.series,
            vec![
                Sample {
                    tick: 1,
                    messages: 2,
                    bytes: 6
                },
                Sample {
                    tick: 3,
                    messages: 1,
                    bytes: 1
                },
            ]
        );
        assert_eq!(traffic.outgoing.messages, 3);
        assert_eq!(traffic.outgoing.peak_bytes(), 6);
        assert_eq!(traffic.incoming, Traffic::default());
        assert_eq!(statistics.traffic(1).unwrap().incoming.bytes, 4);
        assert_eq!(statistics.total_sent(), 3);

        let report = statistics.report(Duration::from_millis(100)).unwrap();
        assert!(report.contains("node=0 sent_messages=3 sent_bytes=7"));
        assert!(report.contains("peak_rate=60B/s"));
    }

    #[test]
    fn test_rate() {
        assert_eq!(rate(100, Duration::from_millis(100)), 1_000);
        assert_eq!(rate(5, Duration::from_secs(1)), 5);
    }

    #[test]
    fn test_parse_format() {
        let registry = super::super::Registry::default();
        let factory = registry
            .parse(&json!({"Name": NAME, "OutputFormat": 1}))
            .unwrap();
        assert!(factory.report(Duration::from_millis(100)).is_some());
        let silent = registry.parse(&json!({"Name": NAME})).unwrap();
        assert!(silent.report(Duration::from_millis(100)).is_none());
        assert!(registry
            .parse(&json!({"Name": NAME, "OutputFormat": 7}))
            .is_none());
    }
}
