//! Suppress repeated deliveries of the same content.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{wire::Digest, NodeId, Tick};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::trace;

pub const NAME: &str = "DuplicateMessageFilter";

/// Default number of ticks a delivered digest is remembered for.
pub const DEFAULT_RETENTION_TICKS: Tick = 1_000;

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let duplicate: Duplicate = super::options(value, NAME)?;
    Some(Arc::new(duplicate))
}

/// Drop received messages whose `(tag, payload)` was already accepted within the retention
/// window, whoever sent them.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Duplicate {
    #[serde(default = "default_retention_ticks")]
    pub retention_ticks: Tick,
}

fn default_retention_ticks() -> Tick {
    DEFAULT_RETENTION_TICKS
}

impl Default for Duplicate {
    fn default() -> Self {
        Self {
            retention_ticks: DEFAULT_RETENTION_TICKS,
        }
    }
}

impl Factory for Duplicate {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        Ok(Box::new(Seen {
            node: context.node,
            retention: self.retention_ticks,
            accepted: HashMap::new(),
            expiries: BTreeMap::new(),
        }))
    }
}

struct Seen {
    node: NodeId,
    retention: Tick,
    accepted: HashMap<Digest, Tick>,
    expiries: BTreeMap<Tick, Vec<Digest>>,
}

impl Seen {
    fn prune(&mut self, tick: Tick) {
        while let Some(entry) = self.expiries.first_entry() {
            if *entry.key() > tick {
                break;
            }
            let (expiry, digests) = entry.remove_entry();
            for digest in digests {
                // Only forget digests that were not accepted again since.
                if self.accepted.get(&digest) == Some(&expiry) {
                    self.accepted.remove(&digest);
                }
            }
        }
    }
}

impl Filter for Seen {
    fn on_receive(&mut self, tick: Tick, message: Message) -> Verdict {
        self.prune(tick);
        let digest = message.digest();
        if self.accepted.contains_key(&digest) {
            trace!(
                node = self.node,
                source = message.source,
                tag = %message.tag,
                reason = "duplicate",
                "dropping message"
            );
            return Verdict::drop();
        }
        let expiry = tick.saturating_add(self.retention);
        self.accepted.insert(digest, expiry);
        self.expiries.entry(expiry).or_default().push(digest);
        Verdict::pass(message)
    }
}
