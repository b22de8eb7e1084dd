//! Force nodes to fall behind and catch up from certificates.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{wire::Wire, NodeId, Round, Tag, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{trace, warn};

pub const NAME: &str = "CatchupFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let catchup: Catchup = super::options(value, NAME)?;
    Some(Arc::new(catchup))
}

/// For every listed node, suppress all votes (sent or received) for `Count` rounds, starting at
/// the round of the first vote the node handles.
///
/// Without votes the node can only advance by observing bundles. Malformed votes are dropped.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Catchup {
    #[serde(default)]
    pub nodes: BTreeSet<NodeId>,
    #[serde(default)]
    pub count: Round,
}

impl Factory for Catchup {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for node in &self.nodes {
            context.check(*node)?;
        }
        Ok(Box::new(Lag {
            node: context.node,
            active: self.nodes.contains(&context.node),
            count: self.count,
            start: None,
        }))
    }
}

struct Lag {
    node: NodeId,
    active: bool,
    count: Round,
    start: Option<Round>,
}

impl Lag {
    fn filter(&mut self, message: Message) -> Verdict {
        if !self.active || message.tag != Tag::Vote {
            return Verdict::pass(message);
        }
        let vote = match Wire::decode_vote(message.tag, &message.payload) {
            Ok(vote) => vote,
            Err(err) => {
                warn!(
                    node = self.node,
                    source = message.source,
                    ?err,
                    "dropping malformed vote"
                );
                return Verdict::drop();
            }
        };
        let start = *self.start.get_or_insert(vote.round);
        if vote.round >= start && vote.round < start.saturating_add(self.count) {
            trace!(
                node = self.node,
                round = vote.round,
                reason = "catchup",
                "dropping message"
            );
            return Verdict::drop();
        }
        Verdict::pass(message)
    }
}

impl Filter for Lag {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.filter(message)
    }

    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.filter(message)
    }
}
