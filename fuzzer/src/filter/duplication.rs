//! Deliver messages more than once.

use super::{select, Context, Factory, Filter, Selector, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, iter, sync::Arc};

pub const NAME: &str = "MessageDuplicationFilter";

/// Extra copies per tag, per node.
pub type Copies = BTreeMap<NodeId, BTreeMap<Selector, usize>>;

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let duplication: Duplication = super::options(value, NAME)?;
    Some(Arc::new(duplication))
}

/// Emit extra copies of messages sent (`Outgoing`, keyed by sender) or received (`Incoming`,
/// keyed by recipient).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Duplication {
    #[serde(default)]
    pub outgoing: Copies,
    #[serde(default)]
    pub incoming: Copies,
}

impl Factory for Duplication {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for node in self.outgoing.keys().chain(self.incoming.keys()) {
            context.check(*node)?;
        }
        Ok(Box::new(Copier {
            outgoing: self.outgoing.get(&context.node).cloned().unwrap_or_default(),
            incoming: self.incoming.get(&context.node).cloned().unwrap_or_default(),
        }))
    }
}

struct Copier {
    outgoing: BTreeMap<Selector, usize>,
    incoming: BTreeMap<Selector, usize>,
}

fn copy(options: &BTreeMap<Selector, usize>, message: Message) -> Verdict {
    let copies = select(options, message.tag).copied().unwrap_or_default();
    let extra: Vec<_> = iter::repeat(message.clone()).take(copies).collect();
    Verdict::extend(message, extra)
}

impl Filter for Copier {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        copy(&self.outgoing, message)
    }

    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        copy(&self.incoming, message)
    }
}
