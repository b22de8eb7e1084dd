use crate::{filter::Chain, Message};
use faultline_agreement::{NodeId, Round, Status};

/// Network-side state of a simulated node.
pub struct Node {
    id: NodeId,
    online: bool,
    status: Status,

    pub(super) chain: Chain,

    /// Messages delivered on the next tick.
    inbox: Vec<Message>,
    /// Messages the node forwards on the next tick on behalf of its filters.
    outbound: Vec<Message>,
}

impl Node {
    pub(super) fn new(id: NodeId, online: bool, chain: Chain) -> Self {
        Self {
            id,
            online,
            status: Status::default(),
            chain,
            inbox: Vec::new(),
            outbound: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether the node holds stake.
    pub fn online(&self) -> bool {
        self.online
    }

    /// Status reported by the participant at the end of the last tick.
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn current_round(&self) -> Round {
        self.status.round
    }

    /// Messages waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub(super) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(super) fn deliver(&mut self, message: Message) {
        self.inbox.push(message);
    }

    pub(super) fn enqueue_outbound(&mut self, message: Message) {
        self.outbound.push(message);
    }

    pub(super) fn take_inbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.inbox)
    }

    pub(super) fn take_outbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbound)
    }
}
