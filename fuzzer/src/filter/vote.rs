//! Drop votes by round, period, and step.

use super::{Context, Factory, Filter, Verdict};
use crate::{Error, Message};
use faultline_agreement::{
    wire::{Vote, Wire},
    NodeId, Period, Round, Step, Tag, Tick,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{trace, warn};

pub const NAME: &str = "VoteFilter";

pub fn parse(value: &Value, _: &super::Registry) -> Option<Arc<dyn Factory>> {
    let votes: Votes = super::options(value, NAME)?;
    Some(Arc::new(votes))
}

/// Set of votes selected by half-open ranges `[start, end)` of round, period, and step.
///
/// Omitted starts are `0` and omitted ends are unbounded.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Mask {
    #[serde(default)]
    pub start_round: Round,
    #[serde(default)]
    pub end_round: Option<Round>,
    #[serde(default)]
    pub start_period: Period,
    #[serde(default)]
    pub end_period: Option<Period>,
    #[serde(default)]
    pub start_step: Step,
    #[serde(default)]
    pub end_step: Option<Step>,
}

/// Whether `value` lies in `[start, end)`, with no end meaning unbounded.
fn within<T: PartialOrd>(value: T, start: T, end: Option<T>) -> bool {
    value >= start && end.map_or(true, |end| value < end)
}

impl Mask {
    /// Whether `vote` falls inside the mask.
    pub fn contains(&self, vote: &Vote) -> bool {
        within(vote.round, self.start_round, self.end_round)
            && within(vote.period, self.start_period, self.end_period)
            && within(vote.step, self.start_step, self.end_step)
    }
}

/// Drop votes (sent or received) that fall inside an exclude mask and outside every include
/// mask.
///
/// Messages that are not votes pass; malformed votes are dropped.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Votes {
    #[serde(default)]
    pub include_masks: Vec<Mask>,
    #[serde(default)]
    pub exclude_masks: Vec<Mask>,
}

impl Votes {
    /// Whether `vote` is let through.
    pub fn allows(&self, vote: &Vote) -> bool {
        !self.exclude_masks.iter().any(|mask| mask.contains(vote))
            || self.include_masks.iter().any(|mask| mask.contains(vote))
    }
}

impl Factory for Votes {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create(&self, context: &Context) -> Result<Box<dyn Filter>, Error> {
        Ok(Box::new(Screen {
            node: context.node,
            votes: self.clone(),
        }))
    }
}

struct Screen {
    node: NodeId,
    votes: Votes,
}

impl Screen {
    fn screen(&self, message: Message) -> Verdict {
        if message.tag != Tag::Vote {
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
        if !self.votes.allows(&vote) {
            trace!(
                node = self.node,
                round = vote.round,
                period = vote.period,
                step = vote.step,
                reason = "masked",
                "dropping message"
            );
            return Verdict::drop();
        }
        Verdict::pass(message)
    }
}

impl Filter for Screen {
    fn on_send(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.screen(message)
    }

    fn on_receive(&mut self, _tick: Tick, message: Message) -> Verdict {
        self.screen(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::mocks::context, mocks::message};
    use faultline_agreement::{wire::DIGEST_LENGTH, CERT, NEXT, SOFT};
    use serde_json::json;
    use test_case::test_case;

    fn vote(round: Round, period: Period, step: Step) -> Vote {
        Vote {
            round,
            period,
            step,
            voter: 0,
            value: [0; DIGEST_LENGTH],
        }
    }

    fn votes() -> Votes {
        Votes {
            // Everything in rounds [10, 20) except cert votes of period 0.
            exclude_masks: vec![Mask {
                start_round: 10,
                end_round: Some(20),
                ..Default::default()
            }],
            include_masks: vec![Mask {
                start_period: 0,
                end_period: Some(1),
                start_step: CERT,
                end_step: Some(CERT + 1),
                ..Default::default()
            }],
        }
    }

    #[test_case(vote(5, 0, SOFT), true; "outside exclude")]
    #[test_case(vote(10, 0, SOFT), false; "excluded start")]
    #[test_case(vote(19, 3, NEXT), false; "excluded end")]
    #[test_case(vote(20, 0, SOFT), true; "exclusive end")]
    #[test_case(vote(15, 0, CERT), true; "include wins")]
    #[test_case(vote(15, 1, CERT), false; "include period miss")]
    fn test_include_takes_precedence(vote: Vote, allowed: bool) {
        assert_eq!(votes().allows(&vote), allowed);
    }

    #[test]
    fn test_filter_drops_masked_and_malformed() {
        let mut filter = votes().create(&context(0, 2)).unwrap();
        let masked = Message {
            payload: Wire::from(vote(12, 0, SOFT)).encode(),
            ..message(1, 0, Tag::Vote, b"")
        };
        assert!(!filter.on_receive(1, masked.clone()).forward);
        assert!(!filter.on_send(1, masked.bounce()).forward);

        assert!(!filter.on_receive(1, message(1, 0, Tag::Vote, b"junk")).forward);
        assert!(filter.on_receive(1, message(1, 0, Tag::Bundle, b"junk")).forward);
    }

    #[test]
    fn test_parse_masks() {
        let factory = super::super::Registry::default()
            .parse(&json!({
                "Name": NAME,
                "ExcludeMasks": [{"StartRound": 3, "EndRound": 4}],
            }))
            .unwrap();
        assert_eq!(factory.name(), NAME);

        let mask: Mask = serde_json::from_value(json!({"StartStep": 2, "EndStep": 2})).unwrap();
        assert!(!mask.contains(&vote(1, 0, CERT)));
    }

    #[test]
    fn test_omitted_ends_are_unbounded() {
        let mask: Mask = serde_json::from_value(json!({"StartStep": CERT})).unwrap();
        assert_eq!(mask, Mask { start_step: CERT, ..Default::default() });
        assert!(mask.contains(&vote(Round::MAX, Period::MAX, Step::MAX)));
        assert!(!mask.contains(&vote(0, 0, SOFT)));

        let mask: Mask = serde_json::from_value(json!({"EndRound": 3})).unwrap();
        assert!(mask.contains(&vote(2, Period::MAX, Step::MAX)));
        assert!(!mask.contains(&vote(3, 0, 0)));
    }
}
