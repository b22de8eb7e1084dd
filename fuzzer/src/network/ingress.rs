use crate::Error;
use faultline_agreement::{NodeId, Outbound, Status, Tick};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// What a node did during a tick.
#[derive(Debug)]
pub struct Report {
    /// Messages the participant asked to send.
    pub outbound: Vec<Outbound>,
    /// Position of the participant after the tick.
    pub status: Status,
}

pub enum Message {
    /// Deliver `inbox` and advance the participant to `tick`.
    Tick {
        tick: Tick,
        inbox: Vec<crate::Message>,
        response: oneshot::Sender<Report>,
    },
}

/// Interface the network uses to drive a node task.
#[derive(Clone)]
pub struct Mailbox {
    node: NodeId,
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(node: NodeId, sender: mpsc::Sender<Message>) -> Self {
        Self { node, sender }
    }

    /// Hand `inbox` to the node and wait for it to finish `tick`.
    pub async fn tick(&mut self, tick: Tick, inbox: Vec<crate::Message>) -> Result<Report, Error> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Tick {
                tick,
                inbox,
                response,
            })
            .await
            .map_err(|_| Error::NodeFailed(self.node))?;
        receiver.await.map_err(|_| Error::NodeFailed(self.node))
    }
}
