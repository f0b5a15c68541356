//! Message types for received and sent messages.

use crate::protocol::packet::BROADCAST;

/// Delivery state of a message.
///
/// `Waiting` is the only non-terminal state; once a message reaches `Ack`
/// or `Failed` it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Sent, pending device-side delivery confirmation.
    Waiting,
    /// Delivery confirmed (or inbound and acknowledged by receipt).
    Ack,
    /// Negative acknowledgement or delivery timeout.
    Failed,
}

impl MessageState {
    /// Returns true for states that admit no further transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ack | Self::Failed)
    }
}

/// Whether a message targets one node or the whole channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Addressed to a specific node.
    Direct,
    /// Addressed to the broadcast sentinel.
    Broadcast,
}

/// Target of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A specific node.
    Node(u32),
    /// All nodes on the channel.
    Broadcast,
}

impl Destination {
    /// Returns the wire-level node address.
    #[must_use]
    pub const fn node_id(self) -> u32 {
        match self {
            Self::Node(id) => id,
            Self::Broadcast => BROADCAST,
        }
    }
}

/// A domain-level message event, produced by the message pipeline from
/// inbound and outbound text/waypoint packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel index the message travelled on.
    pub channel: u8,
    /// Destination node id (or the broadcast sentinel).
    pub to: u32,
    /// Source node id.
    pub from: u32,
    /// Receipt or send timestamp (Unix seconds).
    pub date: u32,
    /// Message id, unique per sender while in flight.
    pub message_id: u32,
    /// Delivery state.
    pub state: MessageState,
    /// Message text.
    pub message: String,
    /// Direct or broadcast.
    pub kind: MessageKind,
}
