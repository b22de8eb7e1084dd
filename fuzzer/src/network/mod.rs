//! Lockstep virtual network.
//!
//! The [Network] owns the clock, every node's filter [Chain](crate::filter::Chain), and the
//! mailboxes of the node tasks. Each [Network::tick] hands every node the messages delivered to
//! it on the previous tick, waits for all of them to report back, and then routes what they sent
//! through the filter chains of the sender and of each recipient.

use crate::{
    config::FuzzerConfig,
    filter::{self, Context, Direction},
    Error, Message,
};
use faultline_agreement::{Builder, Identity, NodeId, Outbound, Recipients, Round, Tick};
use futures::future::join_all;
use prometheus_client::metrics::{counter::Counter, family::Family};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

mod actor;
mod ingress;
mod metrics;
mod node;

use actor::Actor;
use ingress::Mailbox;
pub use node::Node;

enum State {
    /// Built but not started.
    Ready {
        actors: Vec<Actor>,
        mailboxes: Vec<Mailbox>,
    },
    Running {
        mailboxes: Vec<Mailbox>,
        handles: Vec<JoinHandle<()>>,
    },
    Closed,
}

/// Deterministic network of simulated nodes.
pub struct Network {
    name: String,
    disable_traces: bool,
    clock: Tick,
    nodes: Vec<Node>,
    state: State,

    sent_messages: Family<metrics::Message, Counter>,
    delivered_messages: Family<metrics::Message, Counter>,
    filtered_messages: Family<metrics::Message, Counter>,
    ticks: Counter,
}

impl Network {
    /// Build every node's filter chain and participant.
    ///
    /// Fails without building anything if the configuration is invalid or any filter rejects
    /// its options.
    pub fn new(cfg: &FuzzerConfig, builder: &dyn Builder) -> Result<Self, Error> {
        let online = cfg.validate()?;
        let voters: Vec<NodeId> = (0..cfg.nodes).filter(|id| online[*id as usize]).collect();

        let mut nodes = Vec::with_capacity(online.len());
        for id in 0..cfg.nodes {
            let context = Context {
                node: id,
                nodes: cfg.nodes,
                online: online[id as usize],
                tick_granularity: cfg.tick_granularity,
                seed: cfg.seed,
            };
            let chain = filter::build(&cfg.filters, &context)?;
            nodes.push(Node::new(id, context.online, chain));
        }

        let mut actors = Vec::with_capacity(nodes.len());
        let mut mailboxes = Vec::with_capacity(nodes.len());
        for node in &mut nodes {
            let participant = builder.build(Identity {
                id: node.id(),
                online: node.online(),
                voters: voters.clone(),
            });
            node.set_status(participant.status());
            let (actor, mailbox) = Actor::new(node.id(), participant, cfg.disable_traces);
            actors.push(actor);
            mailboxes.push(mailbox);
        }

        let sent_messages = Family::<metrics::Message, Counter>::default();
        let delivered_messages = Family::<metrics::Message, Counter>::default();
        let filtered_messages = Family::<metrics::Message, Counter>::default();
        let ticks = Counter::default();
        if let Some(registry) = &cfg.metrics {
            let mut registry = registry.lock().unwrap();
            registry.register("messages_sent", "messages sent", sent_messages.clone());
            registry.register(
                "messages_delivered",
                "messages delivered",
                delivered_messages.clone(),
            );
            registry.register(
                "messages_filtered",
                "messages dropped or retained by filters",
                filtered_messages.clone(),
            );
            registry.register("ticks", "ticks elapsed", ticks.clone());
        }

        debug!(
            name = %cfg.name,
            nodes = cfg.nodes,
            voters = voters.len(),
            filters = cfg.filters.len(),
            "built network"
        );
        Ok(Self {
            name: cfg.name.clone(),
            disable_traces: cfg.disable_traces,
            clock: 0,
            nodes,
            state: State::Ready { actors, mailboxes },
            sent_messages,
            delivered_messages,
            filtered_messages,
            ticks,
        })
    }

    /// Spawn one task per node.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Ready { actors, mailboxes } => {
                let handles = actors
                    .into_iter()
                    .map(|actor| tokio::spawn(actor.run()))
                    .collect();
                self.state = State::Running { mailboxes, handles };
                info!(name = %self.name, nodes = self.nodes.len(), "started network");
                Ok(())
            }
            running @ State::Running { .. } => {
                self.state = running;
                Err(Error::AlreadyStarted)
            }
            State::Closed => Err(Error::NetworkClosed),
        }
    }

    /// Advance the network by one tick.
    pub async fn tick(&mut self) -> Result<(), Error> {
        let mailboxes = match &mut self.state {
            State::Ready { .. } => return Err(Error::NotStarted),
            State::Closed => return Err(Error::NetworkClosed),
            State::Running { mailboxes, .. } => mailboxes,
        };
        self.clock += 1;
        self.ticks.inc();
        let tick = self.clock;

        // Run every node concurrently
        let inboxes: Vec<_> = self.nodes.iter_mut().map(Node::take_inbox).collect();
        let reports = join_all(
            mailboxes
                .iter_mut()
                .zip(inboxes)
                .map(|(mailbox, inbox)| mailbox.tick(tick, inbox)),
        )
        .await;
        let reports = reports.into_iter().collect::<Result<Vec<_>, _>>()?;

        // Traffic requeued on the previous tick, taken before routing requeues more
        let requeued: Vec<Vec<Message>> = self.nodes.iter_mut().map(Node::take_outbound).collect();

        // Route what each node sent, in node order
        for ((id, report), mut messages) in reports.into_iter().enumerate().zip(requeued) {
            self.nodes[id].set_status(report.status);
            for outbound in report.outbound {
                messages.extend(self.expand(id as NodeId, tick, outbound));
            }
            for mut message in messages {
                message.sent = tick;
                self.send(tick, message);
            }
        }

        // Route what filters release
        for id in 0..self.nodes.len() {
            for (direction, message) in self.nodes[id].chain.tick(tick) {
                match direction {
                    Direction::Outgoing => self.receive(tick, message),
                    Direction::Incoming => self.land(id as NodeId, message),
                }
            }
        }
        Ok(())
    }

    /// Run `ticks` ticks.
    pub async fn run(&mut self, ticks: Tick) -> Result<(), Error> {
        for _ in 0..ticks {
            self.tick().await?;
        }
        Ok(())
    }

    /// Bypass every filter that is not passive on every node.
    pub fn lift_faults(&mut self) {
        for node in &mut self.nodes {
            node.chain.lift();
        }
        info!(name = %self.name, tick = self.clock, "lifted faults");
    }

    /// Close every mailbox and wait for the node tasks to exit.
    ///
    /// Calling it more than once has no effect.
    pub async fn shutdown(&mut self) {
        let State::Running { mailboxes, handles } =
            std::mem::replace(&mut self.state, State::Closed)
        else {
            return;
        };
        drop(mailboxes);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(?err, "node task failed");
            }
        }
        info!(name = %self.name, tick = self.clock, "shut down network");
    }

    /// Ticks elapsed.
    pub fn clock(&self) -> Tick {
        self.clock
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    /// Lowest and highest round among nodes holding stake (`(0, 0)` if there are none).
    pub fn round_bounds(&self) -> (Round, Round) {
        let mut rounds = self
            .nodes
            .iter()
            .filter(|node| node.online())
            .map(Node::current_round);
        let Some(first) = rounds.next() else {
            return (0, 0);
        };
        rounds.fold((first, first), |(low, high), round| {
            (low.min(round), high.max(round))
        })
    }

    /// Address one copy of `outbound` to each of its recipients.
    fn expand(&self, source: NodeId, tick: Tick, outbound: Outbound) -> Vec<Message> {
        let destinations = match outbound.recipients {
            Recipients::All => (0..self.nodes.len() as NodeId).collect(),
            Recipients::Some(destinations) => destinations,
            Recipients::One(destination) => vec![destination],
        };
        let origin = outbound.origin.unwrap_or(source);
        destinations
            .into_iter()
            .filter(|destination| {
                if *destination == source {
                    return false;
                }
                if *destination as usize >= self.nodes.len() {
                    debug!(source, destination, reason = "unknown node", "dropping message");
                    return false;
                }
                true
            })
            .map(|destination| Message {
                source,
                destination,
                origin,
                tag: outbound.tag,
                payload: outbound.payload.clone(),
                sent: tick,
            })
            .collect()
    }

    /// Run `message` through the chain of its source, then route the survivors.
    fn send(&mut self, tick: Tick, message: Message) {
        let label = metrics::Message::new(message.tag);
        self.sent_messages.get_or_create(&label).inc();
        if !self.disable_traces {
            trace!(
                source = message.source,
                destination = message.destination,
                origin = message.origin,
                tag = %message.tag,
                tick,
                "sending message"
            );
        }
        let Some(node) = self.nodes.get_mut(message.source as usize) else {
            debug!(source = message.source, reason = "unknown node", "dropping message");
            return;
        };
        let survivors = node.chain.send(tick, message);
        if survivors.is_empty() {
            self.filtered_messages.get_or_create(&label).inc();
        }
        for message in survivors {
            self.receive(tick, message);
        }
    }

    /// Run `message` through the chain of its destination, then route the survivors.
    fn receive(&mut self, tick: Tick, message: Message) {
        let receiver = message.destination;
        let Some(node) = self.nodes.get_mut(receiver as usize) else {
            debug!(
                source = message.source,
                destination = receiver,
                reason = "unknown node",
                "dropping message"
            );
            return;
        };
        let label = metrics::Message::new(message.tag);
        let survivors = node.chain.receive(tick, message);
        if survivors.is_empty() {
            self.filtered_messages.get_or_create(&label).inc();
        }
        for message in survivors {
            self.land(receiver, message);
        }
    }

    /// Deliver a message that left the inbound chain of `receiver`.
    ///
    /// Messages addressed elsewhere are sent by `receiver` on the next tick.
    fn land(&mut self, receiver: NodeId, message: Message) {
        if message.destination as usize >= self.nodes.len() {
            debug!(
                source = message.source,
                destination = message.destination,
                reason = "unknown node",
                "dropping message"
            );
            return;
        }
        if message.destination == receiver {
            self.delivered_messages
                .get_or_create(&metrics::Message::new(message.tag))
                .inc();
            self.nodes[receiver as usize].deliver(message);
            return;
        }
        let message = message.forward(receiver, message.destination);
        self.nodes[receiver as usize].enqueue_outbound(message);
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if let State::Running { handles, .. } = &self.state {
            for handle in handles {
                handle.abort();
            }
        }
    }
}
