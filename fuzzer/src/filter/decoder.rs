//! Decode every received message.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{wire::Wire, NodeId, Tag, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};
use tracing::warn;

pub const NAME: &str = "MessageDecoderFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let _: Options = super::options(value, NAME)?;
    Some(Arc::new(Decoder::default()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {}

/// Messages decoded across all nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub decoded: BTreeMap<Tag, u64>,
    pub malformed: u64,
}

/// Decode every received payload, counting messages by tag.
///
/// Malformed payloads are dropped.
#[derive(Clone, Debug, Default)]
pub struct Decoder {
    counts: Arc<RwLock<Counts>>,
}

impl Decoder {
    pub fn counts(&self) -> Counts {
        self.counts.read().unwrap().clone()
    }
}

impl Factory for Decoder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        Ok(Box::new(Inspector {
            node: context.node,
            counts: self.counts.clone(),
        }))
    }
}

struct Inspector {
    node: NodeId,
    counts: Arc<RwLock<Counts>>,
}

impl Filter for Inspector {
    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        let decoded = Wire::decode(message.tag, &message.payload);
        let mut counts = self.counts.write().unwrap();
        match decoded {
            Ok(_) => {
                *counts.decoded.entry(message.tag).or_default() += 1;
                Verdict::pass(message)
            }
            Err(err) => {
                counts.malformed += 1;
                warn!(
                    node = self.node,
                    source = message.source,
                    tag = %message.tag,
                    ?err,
                    "dropping malformed message"
                );
                Verdict::drop()
            }
        }
    }

    fn passive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::mocks::context;
    use bytes::Bytes;
    use faultline_agreement::{
        wire::{Vote, DIGEST_LENGTH},
        SOFT,
    };
    use serde_json::json;

    #[test]
    fn test_counts_and_drops_malformed() {
        let decoder = Decoder::default();
        let mut filters: Vec<_> = (0..2)
            .map(|node| decoder.create(&context(node, 2)).unwrap())
            .collect();
        assert!(filters[0].passive());

        let vote = Wire::from(Vote {
            round: 1,
            period: 0,
            step: SOFT,
            voter: 1,
            value: [0; DIGEST_LENGTH],
        })
        .encode();
        let valid = Message {
            source: 1,
            destination: 0,
            origin: 1,
            tag: Tag::Vote,
            payload: vote,
            sent: 0,
        };
        assert!(filters[0].on_receive(1, valid.clone()).forward);
        assert!(filters[1].on_receive(1, valid.forward(0, 1)).forward);

        let malformed = Message {
            payload: Bytes::from_static(b"garbage"),
            ..valid
        };
        assert!(!filters[0].on_receive(1, malformed).forward);

        let counts = decoder.counts();
        assert_eq!(counts.decoded.get(&Tag::Vote), Some(&2));
        assert_eq!(counts.malformed, 1);
    }

    #[test]
    fn test_parse() {
        let registry = super::super::Registry::default();
        assert!(registry.parse(&json!({"Name": NAME})).is_some());
        assert!(registry.parse(&json!({"Name": NAME, "Extra": true})).is_none());
    }
}
