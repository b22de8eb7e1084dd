//! Bounce messages back to their sender.

use super::{select, Context, Factory, Filter, Selector, Verdict};
use crate::{Error, Message};
use faultline_agreement::{NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

pub const NAME: &str = "MessageReflectionFilter";

/// Reflected copies per tag, per node.
pub type Reflections = BTreeMap<NodeId, BTreeMap<Selector, usize>>;

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let reflection: Reflection = super::options(value, NAME)?;
    Some(Arc::new(reflection))
}

/// Reflect messages sent (`Outgoing`, keyed by sender) or received (`Incoming`, keyed by
/// recipient) back to the node that sent them.
///
/// An outgoing message is reflected as if its destination had echoed it; an incoming message is
/// echoed by the receiving node. Reflected copies are sent in addition to the original, unless
/// `Replace` is set.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Reflection {
    #[serde(default)]
    pub outgoing: Reflections,
    #[serde(default)]
    pub incoming: Reflections,
    #[serde(default)]
    pub replace: bool,
}

impl Factory for Reflection {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        for node in self.outgoing.keys().chain(self.incoming.keys()) {
            context.check(*node)?;
        }
        Ok(Box::new(Mirror {
            outgoing: self.outgoing.get(&context.node).cloned().unwrap_or_default(),
            incoming: self.incoming.get(&context.node).cloned().unwrap_or_default(),
            replace: self.replace,
        }))
    }
}

struct Mirror {
    outgoing: BTreeMap<Selector, usize>,
    incoming: BTreeMap<Selector, usize>,
    replace: bool,
}

impl Mirror {
    fn reflect(&self, options: &BTreeMap<Selector, usize>, message: Message) -> Verdict {
        let copies = select(options, message.tag).copied().unwrap_or_default();
        if copies == 0 {
            return Verdict::pass(message);
        }
        let reflected = vec![message.bounce(); copies];
        if self.replace {
            return Verdict::replace(reflected);
        }
        Verdict::extend(message, reflected)
    }
}

impl Filter for Mirror {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.reflect(&self.outgoing, message)
    }

    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.reflect(&self.incoming, message)
    }
}
