//! A small vote-based agreement protocol for exercising the simulator.
//!
//! Every `(round, period)` has a deterministic proposer drawn from the voters. Voters soft-vote
//! the proposal they receive, cert-vote once a soft quorum forms, and commit once a cert quorum
//! forms, broadcasting a [Bundle] so that lagging nodes can catch up. A period that does not
//! commit in time is abandoned through a quorum of next votes. Every node (voter or relay)
//! regossips each fresh, valid message it receives.
//!
//! The protocol makes no attempt at safety under equivocation: it exists to generate realistic
//! traffic patterns and round progress.

use crate::{
    wire::{self, Bundle, Digest, Proposal, Vote, Wire, DIGEST_LENGTH},
    Identity, NodeId, Outbound, Period, Round, Step, Tag, Tick, CERT, NEXT, PROPOSE, SOFT,
};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, trace};

/// Furthest round ahead of the local one for which votes are retained.
const MAX_ROUND_LOOKAHEAD: Round = 16;

/// Configuration of the mock protocol.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base timeout unit; a period times out after `4 * lambda` ticks.
    pub lambda: Tick,

    /// Size of proposed values in bytes.
    pub proposal_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lambda: 5,
            proposal_size: 256,
        }
    }
}

/// Builds one [Agreement] per node.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    cfg: Config,
}

impl Builder {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

impl crate::Builder for Builder {
    fn build(&self, identity: Identity) -> Box<dyn crate::Participant> {
        Box::new(Agreement::new(identity, self.cfg.clone()))
    }
}

/// Participant running the mock protocol.
pub struct Agreement {
    id: NodeId,
    online: bool,
    voters: Vec<NodeId>,
    threshold: usize,
    cfg: Config,

    round: Round,
    period: Period,
    step: Step,
    started: bool,
    now: Tick,
    period_start: Tick,
    last_timeout: Option<Tick>,

    proposals: BTreeMap<(Round, Period), Proposal>,
    votes: BTreeMap<(Round, Period, Step), BTreeMap<Digest, BTreeSet<NodeId>>>,
    cast: BTreeSet<(Round, Period, Step)>,
    seen: BTreeMap<Round, HashSet<Digest>>,
    certificate: Option<Bundle>,

    outbox: Vec<Outbound>,
}

impl Agreement {
    pub fn new(identity: Identity, cfg: Config) -> Self {
        let mut voters = identity.voters;
        voters.sort_unstable();
        voters.dedup();
        let threshold = voters.len() * 2 / 3 + 1;
        Self {
            id: identity.id,
            online: identity.online,
            voters,
            threshold,
            cfg,
            round: 1,
            period: 0,
            step: PROPOSE,
            started: false,
            now: 0,
            period_start: 0,
            last_timeout: None,
            proposals: BTreeMap::new(),
            votes: BTreeMap::new(),
            cast: BTreeSet::new(),
            seen: BTreeMap::new(),
            certificate: None,
            outbox: Vec::new(),
        }
    }

    /// Node expected to propose in `(round, period)`.
    pub fn proposer(&self, round: Round, period: Period) -> Option<NodeId> {
        if self.voters.is_empty() {
            return None;
        }
        let index = (round.wrapping_add(period) % self.voters.len() as u64) as usize;
        Some(self.voters[index])
    }

    fn is_voter(&self, node: NodeId) -> bool {
        self.voters.binary_search(&node).is_ok()
    }

    fn timeout(&self) -> Tick {
        4 * self.cfg.lambda.max(1)
    }

    fn ensure_started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.enter_period(0);
    }

    /// Enter `period` of the current round.
    fn enter_period(&mut self, period: Period) {
        self.period = period;
        self.step = PROPOSE;
        self.period_start = self.now;
        self.last_timeout = None;

        if self.online && self.proposer(self.round, period) == Some(self.id) {
            self.propose();
        }
        self.soft_vote();
        self.recheck();
    }

    fn propose(&mut self) {
        let mut value = Vec::with_capacity(self.cfg.proposal_size.max(20));
        value.extend_from_slice(&self.round.to_be_bytes());
        value.extend_from_slice(&self.period.to_be_bytes());
        value.extend_from_slice(&self.id.to_be_bytes());
        let fill = self.round as u8;
        if value.len() < self.cfg.proposal_size {
            value.resize(self.cfg.proposal_size, fill);
        }
        let proposal = Proposal {
            round: self.round,
            period: self.period,
            proposer: self.id,
            value: Bytes::from(value),
        };
        debug!(
            node = self.id,
            round = self.round,
            period = self.period,
            "proposing"
        );
        let payload = Wire::from(proposal.clone()).encode();
        self.mark_seen(self.round, wire::digest(Tag::Proposal, &payload));
        self.outbox.push(Outbound::broadcast(Tag::Proposal, payload));
        self.proposals
            .insert((proposal.round, proposal.period), proposal);
    }

    /// Cast a vote and count it locally.
    fn vote(&mut self, step: Step, value: Digest) {
        let key = (self.round, self.period, step);
        if !self.online || !self.cast.insert(key) {
            return;
        }
        let vote = Vote {
            round: self.round,
            period: self.period,
            step,
            voter: self.id,
            value,
        };
        let payload = Wire::from(vote.clone()).encode();
        self.mark_seen(self.round, wire::digest(Tag::Vote, &payload));
        self.outbox.push(Outbound::broadcast(Tag::Vote, payload));
        self.record(vote);
    }

    fn soft_vote(&mut self) {
        if self.step > SOFT {
            return;
        }
        let Some(value) = self
            .proposals
            .get(&(self.round, self.period))
            .map(Proposal::digest)
        else {
            return;
        };
        if self.online {
            self.step = SOFT;
        }
        self.vote(SOFT, value);
    }

    /// Count a vote and react to any quorum it completes.
    fn record(&mut self, vote: Vote) {
        let key = (vote.round, vote.period, vote.step);
        let inserted = self
            .votes
            .entry(key)
            .or_default()
            .entry(vote.value)
            .or_default()
            .insert(vote.voter);
        if inserted {
            self.quorum(vote.round, vote.period, vote.step, vote.value);
        }
    }

    /// React to votes for `value` at `(round, period, step)` if they form a quorum.
    fn quorum(&mut self, round: Round, period: Period, step: Step, value: Digest) {
        if round != self.round {
            return;
        }
        let Some(voters) = self
            .votes
            .get(&(round, period, step))
            .and_then(|values| values.get(&value))
        else {
            return;
        };
        if voters.len() < self.threshold {
            return;
        }
        match step {
            SOFT if period == self.period => {
                if self.online && self.step < CERT {
                    self.step = CERT;
                }
                self.vote(CERT, value);
            }
            CERT => {
                let bundle = Bundle {
                    round,
                    period,
                    certifier: self.id,
                    value,
                    voters: voters.iter().copied().collect(),
                };
                self.commit(bundle, true);
            }
            NEXT if period >= self.period => {
                debug!(node = self.id, round, period, "period abandoned");
                self.enter_period(period + 1);
            }
            _ => {}
        }
    }

    /// Re-evaluate stored proposals and votes for the current round.
    fn recheck(&mut self) {
        let round = self.round;
        let pending: Vec<_> = self
            .votes
            .range((round, 0, 0)..(round + 1, 0, 0))
            .flat_map(|(&(r, p, s), values)| values.keys().map(move |value| (r, p, s, *value)))
            .collect();
        for (r, p, s, value) in pending {
            if self.round != round {
                // A stored quorum already moved us forward.
                return;
            }
            self.quorum(r, p, s, value);
        }
    }

    /// Finish the round certified by `bundle` and move to the next one.
    fn commit(&mut self, bundle: Bundle, assembled: bool) {
        if bundle.round < self.round {
            return;
        }
        debug!(
            node = self.id,
            round = bundle.round,
            period = bundle.period,
            assembled,
            "committed round"
        );
        if assembled && self.online {
            let payload = Wire::from(bundle.clone()).encode();
            self.mark_seen(bundle.round, wire::digest(Tag::Bundle, &payload));
            self.outbox.push(Outbound::broadcast(Tag::Bundle, payload));
        }
        self.round = bundle.round + 1;
        self.certificate = Some(bundle);

        // Forget everything about finished rounds.
        let round = self.round;
        self.proposals.retain(|(r, _), _| *r >= round);
        self.votes.retain(|(r, _, _), _| *r >= round);
        self.cast.retain(|(r, _, _)| *r >= round);
        self.seen.retain(|r, _| *r >= round);

        self.enter_period(0);
    }

    fn mark_seen(&mut self, round: Round, digest: Digest) -> bool {
        self.seen.entry(round).or_default().insert(digest)
    }

    fn valid_bundle(&self, bundle: &Bundle) -> bool {
        let distinct: BTreeSet<_> = bundle.voters.iter().copied().collect();
        distinct.len() >= self.threshold && distinct.iter().all(|voter| self.is_voter(*voter))
    }

    fn handle(&mut self, source: NodeId, tag: Tag, payload: Bytes) {
        let message = match Wire::decode(tag, &payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(node = self.id, source, ?err, "dropping malformed message");
                return;
            }
        };

        // Ignore anything that can no longer change our state.
        let (round, origin) = match &message {
            Wire::Vote(vote) => (vote.round, vote.voter),
            Wire::Proposal(proposal) => (proposal.round, proposal.proposer),
            Wire::Bundle(bundle) => (bundle.round, bundle.certifier),
        };
        if round < self.round {
            trace!(node = self.id, source, round, "dropping stale message");
            return;
        }
        if !matches!(message, Wire::Bundle(_)) && round > self.round + MAX_ROUND_LOOKAHEAD {
            trace!(node = self.id, source, round, "dropping distant message");
            return;
        }

        // Validate before relaying.
        let valid = match &message {
            Wire::Vote(vote) => self.is_voter(vote.voter) && vote.step != PROPOSE,
            Wire::Proposal(proposal) => self.proposer(proposal.round, proposal.period)
                == Some(proposal.proposer),
            Wire::Bundle(bundle) => self.valid_bundle(bundle),
        };
        if !valid {
            debug!(node = self.id, source, %tag, "dropping invalid message");
            return;
        }
        if !self.mark_seen(round, wire::digest(tag, &payload)) {
            return;
        }
        self.outbox.push(Outbound::relay(origin, tag, payload));

        match message {
            Wire::Vote(vote) => self.record(vote),
            Wire::Proposal(proposal) => {
                let key = (proposal.round, proposal.period);
                self.proposals.entry(key).or_insert(proposal);
                if key == (self.round, self.period) {
                    self.soft_vote();
                }
            }
            Wire::Bundle(bundle) => self.commit(bundle, false),
        }
    }
}

impl crate::Participant for Agreement {
    fn receive(&mut self, tick: Tick, source: NodeId, tag: Tag, payload: Bytes) -> Vec<Outbound> {
        self.now = tick;
        self.ensure_started();
        self.handle(source, tag, payload);
        std::mem::take(&mut self.outbox)
    }

    fn tick(&mut self, tick: Tick) -> Vec<Outbound> {
        self.now = tick;
        self.ensure_started();

        let since = self.last_timeout.unwrap_or(self.period_start);
        if tick.saturating_sub(since) >= self.timeout() {
            self.last_timeout = Some(tick);
            if self.online {
                debug!(
                    node = self.id,
                    round = self.round,
                    period = self.period,
                    "period timed out"
                );
                self.step = NEXT;
                let key = (self.round, self.period, NEXT);
                if self.cast.contains(&key) {
                    // Repeat our next vote for anyone that missed it.
                    let vote = Vote {
                        round: self.round,
                        period: self.period,
                        step: NEXT,
                        voter: self.id,
                        value: [0; DIGEST_LENGTH],
                    };
                    self.outbox
                        .push(Outbound::broadcast(Tag::Vote, Wire::from(vote).encode()));
                } else {
                    self.vote(NEXT, [0; DIGEST_LENGTH]);
                }
                if let Some(bundle) = &self.certificate {
                    self.outbox.push(Outbound::relay(
                        bundle.certifier,
                        Tag::Bundle,
                        Wire::from(bundle.clone()).encode(),
                    ));
                }
            }
        }
        std::mem::take(&mut self.outbox)
    }

    fn round(&self) -> Round {
        self.round
    }

    fn period(&self) -> Period {
        self.period
    }

    fn step(&self) -> Step {
        self.step
    }
}
