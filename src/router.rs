//! Packet routing and event dispatch.
//!
//! The router is the single consumer of decoded frames. Per frame it:
//!
//! 1. parses the packet (malformed payloads are logged and dropped,
//!    unknown variants flow through as [`PayloadVariant::Unknown`]),
//! 2. gives the session first look at correlated responses; a packet
//!    consumed by a pending request is not also fanned out,
//! 3. feeds the domain components (config tracker, message pipeline) and
//!    emits their domain events,
//! 4. invokes packet subscribers for the packet's topic, synchronously and
//!    in registration order, before the next frame is processed.
//!
//! The synchronous in-order dispatch is what keeps causal ordering between
//! related packets intact for every subscriber.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use crate::config_sync::ConfigSync;
use crate::current_timestamp;
use crate::pipeline::{MessagePipeline, PipelineEvent};
use crate::protocol::packet::{ConfigLeaf, Packet, PayloadVariant};
use crate::protocol::parser::parse_packet;
use crate::session::RequestSession;
use crate::transport::Transport;
use crate::types::{LocalNode, Message, NodeInfo, Position, Telemetry};

/// Classification of a packet for subscription purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Text messages.
    Text,
    /// Waypoints.
    Waypoint,
    /// Admin packets.
    Admin,
    /// Telemetry snapshots.
    Telemetry,
    /// Routing results.
    Routing,
    /// Position reports.
    Position,
    /// Node information.
    NodeInfo,
    /// Configuration chunks (radio and module).
    Config,
    /// Unrecognized payload variants.
    Unknown,
}

impl Topic {
    /// The topic a payload variant belongs to.
    #[must_use]
    pub const fn of(payload: &PayloadVariant) -> Self {
        match payload {
            PayloadVariant::Text(_) => Self::Text,
            PayloadVariant::Waypoint(_) => Self::Waypoint,
            PayloadVariant::Admin { .. } => Self::Admin,
            PayloadVariant::Telemetry(_) => Self::Telemetry,
            PayloadVariant::Routing { .. } => Self::Routing,
            PayloadVariant::Position(_) => Self::Position,
            PayloadVariant::NodeInfo(_) | PayloadVariant::MyNodeInfo { .. } => Self::NodeInfo,
            PayloadVariant::Config { .. } => Self::Config,
            PayloadVariant::Unknown { .. } => Self::Unknown,
        }
    }
}

/// Domain events emitted by the router.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection established.
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// An inbound message arrived.
    Message(Message),
    /// A previously sent message changed delivery state.
    MessageState(Message),
    /// Telemetry received.
    Telemetry {
        /// Reporting node.
        from: u32,
        /// The snapshot.
        telemetry: Telemetry,
    },
    /// Position received.
    Position {
        /// Reporting node.
        from: u32,
        /// The report.
        position: Position,
    },
    /// Node information received.
    NodeInfo(NodeInfo),
    /// The device reported the local node's id.
    MyNodeInfo {
        /// The local node id.
        node_id: u32,
    },
    /// A configuration leaf arrived.
    ConfigUpdated {
        /// Which leaf.
        leaf: ConfigLeaf,
    },
    /// The configuration session reached completion.
    ConfigComplete,
}

struct Subscriber {
    name: String,
    topic: Topic,
    handler: Box<dyn Fn(&Packet) + Send + Sync>,
}

/// Routes decoded frames to the session, domain components, and packet
/// subscribers.
pub struct PacketRouter<T> {
    session: Arc<RequestSession<T>>,
    pipeline: Arc<MessagePipeline<T>>,
    config: Arc<ConfigSync>,
    local_node: Arc<LocalNode>,
    subscribers: StdMutex<Vec<Subscriber>>,
    event_txs: StdMutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl<T: Transport> PacketRouter<T> {
    /// Creates a router over the given components.
    #[must_use]
    pub fn new(
        session: Arc<RequestSession<T>>,
        pipeline: Arc<MessagePipeline<T>>,
        config: Arc<ConfigSync>,
        local_node: Arc<LocalNode>,
    ) -> Self {
        Self {
            session,
            pipeline,
            config,
            local_node,
            subscribers: StdMutex::new(Vec::new()),
            event_txs: StdMutex::new(Vec::new()),
        }
    }

    /// Registers a named packet subscriber for one topic.
    ///
    /// Subscribers for the same topic run in registration order. Handlers
    /// run on the read loop and must not subscribe or unsubscribe from
    /// within.
    pub fn subscribe(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Subscriber {
                name: name.into(),
                topic,
                handler: Box::new(handler),
            });
    }

    /// Removes a named subscriber. Returns true if it existed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        let before = subscribers.len();
        subscribers.retain(|s| s.name != name);
        subscribers.len() != before
    }

    /// Opens a domain event stream.
    ///
    /// Events arrive in processing order; the channel is unbounded so a
    /// slow consumer cannot stall the read loop.
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_txs
            .lock()
            .expect("event channel list poisoned")
            .push(tx);
        rx
    }

    /// Emits a domain event to every open event stream.
    pub fn emit(&self, event: Event) {
        let mut txs = self.event_txs.lock().expect("event channel list poisoned");
        txs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Processes one decoded frame.
    pub fn on_frame(&self, frame: &[u8]) {
        let packet = match parse_packet(frame, current_timestamp()) {
            Ok(packet) => packet,
            Err(e) => {
                // Forward compatibility: a payload this library cannot
                // parse must not take the pipeline down.
                tracing::warn!("dropping unparseable packet: {}", e);
                return;
            }
        };

        tracing::trace!(
            "packet from={} to={} id={} request_id={} topic={:?}",
            packet.from,
            packet.to,
            packet.id,
            packet.request_id,
            Topic::of(&packet.payload)
        );

        // Correlated responses resolve their pending request and stop
        // here; they are not also broadcast as generic events.
        if packet.is_response() && self.session.complete(packet.request_id, packet.clone()) {
            return;
        }

        self.route_domain(&packet);
        self.dispatch_packet(&packet);
    }

    /// Feeds the domain components and emits their events.
    fn route_domain(&self, packet: &Packet) {
        match &packet.payload {
            PayloadVariant::Config { leaf, data } => {
                let completed = self.config.on_chunk(*leaf, data.clone());
                self.emit(Event::ConfigUpdated { leaf: *leaf });
                if completed {
                    tracing::debug!(
                        "config complete, root hash {}",
                        hex::encode(self.config.snapshot().root_hash())
                    );
                    self.emit(Event::ConfigComplete);
                }
            }
            PayloadVariant::MyNodeInfo { node_id } => {
                self.local_node.set(*node_id);
                tracing::debug!("local node id is {}", node_id);
                self.emit(Event::MyNodeInfo { node_id: *node_id });
            }
            PayloadVariant::Text(_) | PayloadVariant::Waypoint(_) | PayloadVariant::Routing { .. } => {
                match self.pipeline.on_packet(packet) {
                    Some(PipelineEvent::Message(message)) => self.emit(Event::Message(message)),
                    Some(PipelineEvent::StateChanged(message)) => {
                        self.emit(Event::MessageState(message));
                    }
                    None => {}
                }
            }
            PayloadVariant::Telemetry(telemetry) => self.emit(Event::Telemetry {
                from: packet.from,
                telemetry: telemetry.clone(),
            }),
            PayloadVariant::Position(position) => self.emit(Event::Position {
                from: packet.from,
                position: position.clone(),
            }),
            PayloadVariant::NodeInfo(node_info) => self.emit(Event::NodeInfo(node_info.clone())),
            PayloadVariant::Admin { opcode, .. } => {
                tracing::debug!("unsolicited admin packet, opcode 0x{:02x}", opcode);
            }
            PayloadVariant::Unknown { tag, data } => {
                tracing::debug!(
                    "unknown payload variant 0x{:02x} ({} bytes)",
                    tag,
                    data.len()
                );
            }
        }
    }

    /// Invokes packet subscribers for the packet's topic, in registration
    /// order.
    fn dispatch_packet(&self, packet: &Packet) {
        let topic = Topic::of(&packet.payload);
        let subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        for subscriber in subscribers.iter().filter(|s| s.topic == topic) {
            (subscriber.handler)(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::admin;
    use crate::protocol::frame::HEADER_SIZE;
    use crate::protocol::packet::BROADCAST;
    use crate::transport::mock::{MockHandle, MockTransport};
    use bytes::Bytes;
    use tokio::sync::Mutex;

    struct Stack {
        router: Arc<PacketRouter<MockTransport>>,
        session: Arc<RequestSession<MockTransport>>,
        config: Arc<ConfigSync>,
        local_node: Arc<LocalNode>,
        handle: MockHandle,
    }

    async fn stack() -> Stack {
        let (mut transport, handle) = MockTransport::new();
        transport.connect().await.unwrap();
        let transport = Arc::new(Mutex::new(transport));
        let local_node = Arc::new(LocalNode::new());
        let session = Arc::new(RequestSession::new(
            Arc::clone(&transport),
            Arc::clone(&local_node),
        ));
        let pipeline = Arc::new(MessagePipeline::new(
            Arc::clone(&transport),
            Arc::clone(&local_node),
        ));
        let config = Arc::new(ConfigSync::new());
        let router = Arc::new(PacketRouter::new(
            Arc::clone(&session),
            pipeline,
            Arc::clone(&config),
            Arc::clone(&local_node),
        ));
        Stack {
            router,
            session,
            config,
            local_node,
            handle,
        }
    }

    fn text_packet(from: u32, text: &str) -> Packet {
        Packet {
            from,
            to: BROADCAST,
            channel: 0,
            id: 61,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Text(text.into()),
        }
    }

    #[tokio::test]
    async fn test_subscribers_run_in_registration_order() {
        let stack = stack().await;

        let order = Arc::new(StdMutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            stack.router.subscribe(Topic::Text, name, move |_| {
                order.lock().unwrap().push(name);
            });
        }

        stack.router.on_frame(&text_packet(9, "hi").encode());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_packets_delivered_in_decode_order() {
        let stack = stack().await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            stack.router.subscribe(Topic::Text, "collector", move |p| {
                if let PayloadVariant::Text(t) = &p.payload {
                    seen.lock().unwrap().push(t.clone());
                }
            });
        }

        for text in ["one", "two", "three"] {
            stack.router.on_frame(&text_packet(9, text).encode());
        }
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_correlated_response_not_fanned_out() {
        let stack = stack().await;

        let admin_seen = Arc::new(StdMutex::new(0usize));
        {
            let admin_seen = Arc::clone(&admin_seen);
            stack.router.subscribe(Topic::Admin, "spy", move |_| {
                *admin_seen.lock().unwrap() += 1;
            });
        }

        let request_task = {
            let session = Arc::clone(&stack.session);
            tokio::spawn(async move { session.ping().await })
        };

        let mut handle = stack.handle;
        let framed = handle.written.recv().await.unwrap();
        let request = parse_packet(&framed[HEADER_SIZE..], 0).unwrap();

        let response = Packet {
            from: 1,
            to: 0,
            channel: 0,
            id: 500,
            request_id: request.id,
            rx_time: 0,
            payload: PayloadVariant::Admin {
                opcode: admin::AdminOpcode::Pong as u8,
                data: Bytes::new(),
            },
        };
        stack.router.on_frame(&response.encode());

        let resolved = request_task.await.unwrap().unwrap();
        assert_eq!(resolved.request_id, request.id);
        // The response was consumed by the session, not broadcast.
        assert_eq!(*admin_seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_admin_still_fans_out() {
        let stack = stack().await;

        let admin_seen = Arc::new(StdMutex::new(0usize));
        {
            let admin_seen = Arc::clone(&admin_seen);
            stack.router.subscribe(Topic::Admin, "spy", move |_| {
                *admin_seen.lock().unwrap() += 1;
            });
        }

        // request_id set but nothing pending: a stale response.
        let stale = Packet {
            from: 1,
            to: 0,
            channel: 0,
            id: 500,
            request_id: 2,
            rx_time: 0,
            payload: PayloadVariant::Admin {
                opcode: admin::AdminOpcode::Pong as u8,
                data: Bytes::new(),
            },
        };
        stack.router.on_frame(&stale.encode());
        assert_eq!(*admin_seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_config_chunks_drive_tracker_and_events() {
        let stack = stack().await;
        let mut events = stack.router.events();

        for leaf in ConfigLeaf::ALL {
            let packet = Packet {
                from: 1,
                to: 0,
                channel: 0,
                id: 70,
                request_id: 0,
                rx_time: 0,
                payload: PayloadVariant::Config {
                    leaf,
                    data: Bytes::from_static(b"cfg"),
                },
            };
            stack.router.on_frame(&packet.encode());
        }

        assert!(stack.config.is_complete());

        let mut updated = 0;
        let mut complete = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::ConfigUpdated { .. } => updated += 1,
                Event::ConfigComplete => complete += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(updated, ConfigLeaf::COUNT);
        assert_eq!(complete, 1);
    }

    #[tokio::test]
    async fn test_my_node_info_sets_local_node() {
        let stack = stack().await;

        let packet = Packet {
            from: 7,
            to: 0,
            channel: 0,
            id: 80,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::MyNodeInfo { node_id: 7 },
        };
        stack.router.on_frame(&packet.encode());
        assert_eq!(stack.local_node.get(), Some(7));
    }

    #[tokio::test]
    async fn test_unknown_variant_reaches_its_subscribers_only() {
        let stack = stack().await;

        let unknown_seen = Arc::new(StdMutex::new(0usize));
        {
            let unknown_seen = Arc::clone(&unknown_seen);
            stack.router.subscribe(Topic::Unknown, "fwd", move |_| {
                *unknown_seen.lock().unwrap() += 1;
            });
        }

        let packet = Packet {
            from: 1,
            to: 2,
            channel: 0,
            id: 90,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Unknown {
                tag: 0x6F,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        };
        stack.router.on_frame(&packet.encode());
        assert_eq!(*unknown_seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped_quietly() {
        let stack = stack().await;
        // Too short for even a header; must not panic or dispatch.
        stack.router.on_frame(&[0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_inbound_text_emits_message_event() {
        let stack = stack().await;
        stack.local_node.set(7);
        let mut events = stack.router.events();

        stack.router.on_frame(&text_packet(99, "hello").encode());

        let Ok(Event::Message(message)) = events.try_recv() else {
            panic!("expected message event");
        };
        assert_eq!(message.from, 99);
        assert_eq!(message.message, "hello");
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let stack = stack().await;

        let count = Arc::new(StdMutex::new(0usize));
        {
            let count = Arc::clone(&count);
            stack.router.subscribe(Topic::Text, "temp", move |_| {
                *count.lock().unwrap() += 1;
            });
        }

        stack.router.on_frame(&text_packet(9, "x").encode());
        assert!(stack.router.unsubscribe("temp"));
        assert!(!stack.router.unsubscribe("temp"));
        stack.router.on_frame(&text_packet(9, "y").encode());
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
