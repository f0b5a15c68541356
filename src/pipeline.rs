//! Message pipeline: outbound sends with hook chain and delivery-state
//! tracking, inbound packet-to-message conversion.
//!
//! Outbound messages get a fresh odd message id (correlation ids are even,
//! so the two spaces never collide), pass through the registered handler
//! chain in registration order, and are recorded in `Waiting` state until a
//! routing result or expiry resolves them. A handler failure is logged and
//! never prevents the send nor stops later handlers.
//!
//! Inbound conversion is a fixed, testable contract: a packet addressed to
//! the broadcast sentinel is a `Broadcast` message, anything else `Direct`;
//! the state is `Ack` iff the packet's source is not the local node (an
//! inbound message is acknowledged by receipt), and `Waiting` otherwise
//! (our own message echoed back, still pending delivery confirmation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::current_timestamp;
use crate::error::Result;
use crate::protocol::packet::{Packet, PayloadVariant};
use crate::protocol::frame;
use crate::transport::Transport;
use crate::types::{Destination, LocalNode, Message, MessageKind, MessageState, Waypoint};

/// Outbound hook invoked on every message before it is sent.
pub type PipelineHandler = Box<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Output of feeding an inbound packet to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An inbound message arrived.
    Message(Message),
    /// A previously sent message changed delivery state.
    StateChanged(Message),
}

struct SentEntry {
    message: Message,
    sent_at: Instant,
}

/// Converts between packets and domain-level messages, tracking
/// acknowledgement state for everything sent.
pub struct MessagePipeline<T> {
    transport: Arc<Mutex<T>>,
    local_node: Arc<LocalNode>,
    next_id: AtomicU32,
    handlers: StdMutex<Vec<(String, PipelineHandler)>>,
    sent: StdMutex<HashMap<u32, SentEntry>>,
}

impl<T: Transport> MessagePipeline<T> {
    /// Creates a new pipeline over the given transport.
    #[must_use]
    pub fn new(transport: Arc<Mutex<T>>, local_node: Arc<LocalNode>) -> Self {
        Self {
            transport,
            local_node,
            next_id: AtomicU32::new(1),
            handlers: StdMutex::new(Vec::new()),
            sent: StdMutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh odd message id.
    fn next_message_id(&self) -> u32 {
        self.next_id.fetch_add(2, Ordering::SeqCst) | 1
    }

    /// Registers a named outbound handler, appended to the chain.
    ///
    /// Re-registering an existing name replaces the handler but keeps its
    /// position in the chain.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Message) -> Result<()> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut handlers = self.handlers.lock().expect("handler chain poisoned");
        if let Some(slot) = handlers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = Box::new(handler);
        } else {
            handlers.push((name, Box::new(handler)));
        }
    }

    /// Removes a named handler. Returns true if it existed.
    pub fn unregister_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.lock().expect("handler chain poisoned");
        let before = handlers.len();
        handlers.retain(|(n, _)| n != name);
        handlers.len() != before
    }

    /// Runs the handler chain; failures are logged and skipped.
    fn run_handlers(&self, message: &Message) {
        let handlers = self.handlers.lock().expect("handler chain poisoned");
        for (name, handler) in handlers.iter() {
            if let Err(e) = handler(message) {
                tracing::warn!("pipeline handler '{}' failed: {}", name, e);
            }
        }
    }

    /// Sends a text message.
    ///
    /// Returns the tracked message in `Waiting` state.
    pub async fn send_text(
        &self,
        destination: Destination,
        channel: u8,
        text: impl Into<String>,
    ) -> Result<Message> {
        let text = text.into();
        self.send_payload(destination, channel, text.clone(), PayloadVariant::Text(text))
            .await
    }

    /// Sends a waypoint.
    pub async fn send_waypoint(
        &self,
        destination: Destination,
        channel: u8,
        waypoint: Waypoint,
    ) -> Result<Message> {
        let label = waypoint.name.clone();
        self.send_payload(
            destination,
            channel,
            label,
            PayloadVariant::Waypoint(waypoint),
        )
        .await
    }

    async fn send_payload(
        &self,
        destination: Destination,
        channel: u8,
        text: String,
        payload: PayloadVariant,
    ) -> Result<Message> {
        let message_id = self.next_message_id();
        let from = self.local_node.id_or_zero();
        let kind = match destination {
            Destination::Broadcast => MessageKind::Broadcast,
            Destination::Node(_) => MessageKind::Direct,
        };

        let message = Message {
            channel,
            to: destination.node_id(),
            from,
            date: current_timestamp(),
            message_id,
            state: MessageState::Waiting,
            message: text,
            kind,
        };

        self.run_handlers(&message);

        let packet = Packet {
            from,
            to: destination.node_id(),
            channel,
            id: message_id,
            request_id: 0,
            rx_time: 0,
            payload,
        };
        let framed = frame::encode(&packet.encode());
        {
            let mut transport = self.transport.lock().await;
            transport.send(framed).await?;
        }

        self.sent.lock().expect("sent map poisoned").insert(
            message_id,
            SentEntry {
                message: message.clone(),
                sent_at: Instant::now(),
            },
        );

        tracing::debug!("message {} sent, awaiting delivery result", message_id);
        Ok(message)
    }

    /// Feeds an inbound packet to the pipeline.
    ///
    /// Text and waypoint packets convert to [`PipelineEvent::Message`];
    /// routing packets correlated to a sent message resolve its delivery
    /// state. Anything else is not the pipeline's business.
    pub fn on_packet(&self, packet: &Packet) -> Option<PipelineEvent> {
        match &packet.payload {
            PayloadVariant::Text(text) => {
                Some(PipelineEvent::Message(self.to_message(packet, text.clone())))
            }
            PayloadVariant::Waypoint(waypoint) => Some(PipelineEvent::Message(
                self.to_message(packet, waypoint.name.clone()),
            )),
            PayloadVariant::Routing { error_code } => {
                self.resolve_sent(packet.request_id, *error_code)
                    .map(PipelineEvent::StateChanged)
            }
            _ => None,
        }
    }

    /// Builds the message DTO for an inbound packet, applying the state
    /// inference rule.
    fn to_message(&self, packet: &Packet, text: String) -> Message {
        let state = if self.local_node.get() == Some(packet.from) {
            MessageState::Waiting
        } else {
            MessageState::Ack
        };
        let kind = if packet.is_broadcast() {
            MessageKind::Broadcast
        } else {
            MessageKind::Direct
        };

        Message {
            channel: packet.channel,
            to: packet.to,
            from: packet.from,
            date: packet.rx_time,
            message_id: packet.id,
            state,
            message: text,
            kind,
        }
    }

    /// Applies a routing result to a sent message, if one matches and is
    /// still `Waiting`. Terminal states never change.
    fn resolve_sent(&self, message_id: u32, error_code: u8) -> Option<Message> {
        let mut sent = self.sent.lock().expect("sent map poisoned");
        let entry = sent.get_mut(&message_id)?;
        if entry.message.state.is_terminal() {
            return None;
        }

        entry.message.state = if error_code == 0 {
            MessageState::Ack
        } else {
            tracing::debug!("message {} nacked: reason {}", message_id, error_code);
            MessageState::Failed
        };
        Some(entry.message.clone())
    }

    /// Current state of a sent message.
    #[must_use]
    pub fn message(&self, message_id: u32) -> Option<Message> {
        self.sent
            .lock()
            .expect("sent map poisoned")
            .get(&message_id)
            .map(|entry| entry.message.clone())
    }

    /// Marks every `Waiting` message older than `max_age` as `Failed` and
    /// returns the resulting state-change events.
    pub fn fail_expired(&self, max_age: Duration) -> Vec<Message> {
        let mut sent = self.sent.lock().expect("sent map poisoned");
        let now = Instant::now();
        let mut failed = Vec::new();
        for entry in sent.values_mut() {
            if entry.message.state == MessageState::Waiting
                && now.duration_since(entry.sent_at) >= max_age
            {
                entry.message.state = MessageState::Failed;
                failed.push(entry.message.clone());
            }
        }
        if !failed.is_empty() {
            tracing::debug!("{} messages expired without delivery result", failed.len());
        }
        failed
    }
}
