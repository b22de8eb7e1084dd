//! Task owning the participant of a node.

use super::ingress::{Mailbox, Message, Report};
use faultline_agreement::{NodeId, Participant};
use futures::{channel::mpsc, StreamExt};
use tracing::{debug, trace};

/// Size of a node's mailbox (the network never has more than one tick in flight).
const MAILBOX_SIZE: usize = 1;

pub struct Actor {
    node: NodeId,
    participant: Box<dyn Participant>,
    disable_traces: bool,

    mailbox: mpsc::Receiver<Message>,
}

impl Actor {
    pub fn new(
        node: NodeId,
        participant: Box<dyn Participant>,
        disable_traces: bool,
    ) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(MAILBOX_SIZE);
        (
            Self {
                node,
                participant,
                disable_traces,
                mailbox: receiver,
            },
            Mailbox::new(node, sender),
        )
    }

    /// Serve the mailbox until the network closes it.
    pub async fn run(mut self) {
        while let Some(message) = self.mailbox.next().await {
            match message {
                Message::Tick {
                    tick,
                    inbox,
                    response,
                } => {
                    let mut outbound = Vec::new();
                    for message in inbox {
                        if !self.disable_traces {
                            trace!(
                                node = self.node,
                                source = message.source,
                                origin = message.origin,
                                tag = %message.tag,
                                sent = message.sent,
                                tick,
                                "receiving message"
                            );
                        }
                        outbound.extend(self.participant.receive(
                            tick,
                            message.source,
                            message.tag,
                            message.payload,
                        ));
                    }
                    outbound.extend(self.participant.tick(tick));

                    let report = Report {
                        outbound,
                        status: self.participant.status(),
                    };
                    if response.send(report).is_err() {
                        debug!(node = self.node, "network dropped tick response");
                        break;
                    }
                }
            }
        }
        debug!(node = self.node, "mailbox closed");
    }
}
