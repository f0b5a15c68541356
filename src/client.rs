//! Main [`MeshLink`] client implementation.
//!
//! This module provides the high-level [`MeshLink`] client that combines
//! transport, frame decoding, routing, the request session, the config
//! tracker, and the message pipeline into a unified interface.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config_sync::{ConfigSnapshot, ConfigSync};
use crate::error::{Error, Result};
use crate::pipeline::MessagePipeline;
use crate::protocol::FrameDecoder;
use crate::protocol::packet::{ConfigLeaf, Packet};
use crate::router::{Event, PacketRouter, Topic};
use crate::session::RequestSession;
use crate::transport::serial::SerialConfig;
use crate::transport::tcp::TcpConfig;
use crate::transport::{SerialTransport, TcpTransport, Transport};
use crate::types::{Destination, LocalNode, Message, Waypoint};

#[cfg(feature = "ble")]
use crate::transport::ble::{BleConfig, BleTransport};

/// Client for communicating with a mesh-radio device.
///
/// One client owns one physical link; there is exactly one frame decoder
/// and one router per connection.
pub struct MeshLink<T> {
    transport: Arc<Mutex<T>>,
    session: Arc<RequestSession<T>>,
    pipeline: Arc<MessagePipeline<T>>,
    config: Arc<ConfigSync>,
    router: Arc<PacketRouter<T>>,
    local_node: Arc<LocalNode>,
    read_task: Option<JoinHandle<()>>,
}

impl MeshLink<TcpTransport> {
    /// Creates a new client for a network-attached device.
    ///
    /// Uses the default device port 4403.
    #[must_use]
    pub fn tcp(host: impl Into<String>) -> Self {
        Self::with_tcp_config(TcpConfig::new(host))
    }

    /// Creates a new client with custom TCP configuration.
    #[must_use]
    pub fn with_tcp_config(config: TcpConfig) -> Self {
        Self::new(TcpTransport::new(config))
    }
}

impl MeshLink<SerialTransport> {
    /// Creates a new client for a serial port.
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_serial_config(SerialConfig::new(port))
    }

    /// Creates a new client with custom serial configuration.
    #[must_use]
    pub fn with_serial_config(config: SerialConfig) -> Self {
        Self::new(SerialTransport::new(config))
    }
}

#[cfg(feature = "ble")]
impl MeshLink<BleTransport> {
    /// Creates a new client for a BLE device.
    #[must_use]
    pub fn ble(device_name: impl Into<String>) -> Self {
        Self::with_ble_config(BleConfig::new(device_name))
    }

    /// Creates a new client with custom BLE configuration.
    #[must_use]
    pub fn with_ble_config(config: BleConfig) -> Self {
        Self::new(BleTransport::new(config))
    }
}

impl<T: Transport + 'static> MeshLink<T> {
    /// Creates a new client with the given transport.
    fn new(transport: T) -> Self {
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
            Arc::clone(&pipeline),
            Arc::clone(&config),
            Arc::clone(&local_node),
        ));

        Self {
            transport,
            session,
            pipeline,
            config,
            router,
            local_node,
            read_task: None,
        }
    }

    /// Connects to the device.
    ///
    /// This will:
    /// 1. Open the transport connection
    /// 2. Start the background read loop (decode → route)
    /// 3. Kick off the configuration handshake
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] (or a transport-specific error) if
    /// the target is unreachable.
    pub async fn connect(&mut self) -> Result<()> {
        let reader = {
            let mut transport = self.transport.lock().await;
            transport.connect().await?;
            transport.take_reader()
        };
        let reader = reader.ok_or(Error::NotConnected)?;

        self.spawn_read_loop(reader);
        self.router.emit(Event::Connected);

        // Ask the device to stream its configuration. The response and
        // the config chunks arrive through the read loop; a handshake
        // failure surfaces as stalled config progress, not a crash.
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            if let Err(e) = session.want_config().await {
                tracing::warn!("configuration handshake failed: {}", e);
            }
        });

        Ok(())
    }

    /// Starts the background read loop.
    ///
    /// The decode buffer is owned exclusively by this task; when the byte
    /// channel closes (link death), the loop cascades: all pending
    /// requests are rejected with `ConnectionLost`, config progress is
    /// reset, and `Disconnected` is emitted.
    fn spawn_read_loop(&mut self, mut reader: mpsc::Receiver<Bytes>) {
        let router = Arc::clone(&self.router);
        let session = Arc::clone(&self.session);
        let config = Arc::clone(&self.config);

        let task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            while let Some(chunk) = reader.recv().await {
                decoder.feed(&chunk);
                loop {
                    match decoder.decode() {
                        Ok(Some(frame)) => router.on_frame(&frame),
                        Ok(None) => break,
                        Err(e) => {
                            // Recovered locally; the decoder has already
                            // realigned to the next plausible frame.
                            tracing::warn!("frame corruption: {}", e);
                        }
                    }
                }
            }

            tracing::debug!("byte stream ended");
            session.fail_all();
            config.reset();
            router.emit(Event::Disconnected);
        });
        self.read_task = Some(task);
    }

    /// Disconnects from the device.
    ///
    /// All outstanding requests are rejected with `ConnectionLost` and
    /// config progress resets; the underlying handle is released on every
    /// exit path.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }

        {
            let mut transport = self.transport.lock().await;
            transport.disconnect().await?;
        }

        self.session.fail_all();
        self.config.reset();
        self.router.emit(Event::Disconnected);

        Ok(())
    }

    /// Returns true if connected.
    pub async fn is_connected(&self) -> bool {
        let transport = self.transport.lock().await;
        transport.is_connected()
    }

    /// Returns the local node id, once the device has reported it.
    #[must_use]
    pub fn local_node_id(&self) -> Option<u32> {
        self.local_node.get()
    }

    // ==================== Subscriptions & Events ====================

    /// Registers a named packet subscriber for one topic.
    pub fn subscribe(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) {
        self.router.subscribe(topic, name, handler);
    }

    /// Removes a named packet subscriber.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.router.unsubscribe(name)
    }

    /// Opens a domain event stream.
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedReceiver<Event> {
        self.router.events()
    }

    // ==================== Configuration ====================

    /// Configuration progress for the current session, in percent.
    #[must_use]
    pub fn config_progress(&self) -> u8 {
        self.config.percent_complete()
    }

    /// True once every configuration leaf has been received.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.is_complete()
    }

    /// Registers a callback fired when configuration completes.
    pub fn on_config_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.config.on_complete(callback);
    }

    /// Digest snapshot of the received configuration.
    #[must_use]
    pub fn config_snapshot(&self) -> ConfigSnapshot {
        self.config.snapshot()
    }

    /// Reads one configuration leaf from the device.
    pub async fn get_config(&self, leaf: ConfigLeaf) -> Result<Packet> {
        self.session.get_config(leaf).await
    }

    /// Writes one configuration leaf to the device.
    pub async fn set_config(&self, leaf: ConfigLeaf, value: &[u8]) -> Result<Packet> {
        self.session.set_config(leaf, value).await
    }

    // ==================== Messaging ====================

    /// Sends a text message.
    pub async fn send_text(
        &self,
        destination: Destination,
        channel: u8,
        text: impl Into<String>,
    ) -> Result<Message> {
        self.pipeline.send_text(destination, channel, text).await
    }

    /// Sends a waypoint.
    pub async fn send_waypoint(
        &self,
        destination: Destination,
        channel: u8,
        waypoint: Waypoint,
    ) -> Result<Message> {
        self.pipeline.send_waypoint(destination, channel, waypoint).await
    }

    /// Registers a named outbound message handler.
    pub fn register_pipeline_handler(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Message) -> Result<()> + Send + Sync + 'static,
    ) {
        self.pipeline.register_handler(name, handler);
    }

    /// Removes a named outbound message handler.
    pub fn unregister_pipeline_handler(&self, name: &str) -> bool {
        self.pipeline.unregister_handler(name)
    }

    /// Marks stale `Waiting` messages as `Failed`.
    pub fn fail_expired_messages(&self, max_age: Duration) -> Vec<Message> {
        self.pipeline.fail_expired(max_age)
    }

    // ==================== Device Operations ====================

    /// Probes device liveness.
    pub async fn ping(&self) -> Result<Packet> {
        self.session.ping().await
    }

    /// Reads device metadata.
    pub async fn get_metadata(&self) -> Result<Packet> {
        self.session.get_metadata().await
    }

    /// Reboots the device.
    pub async fn reboot(&self) -> Result<Packet> {
        self.session.reboot().await
    }

    /// Returns the request session for direct request access.
    #[must_use]
    pub fn session(&self) -> &Arc<RequestSession<T>> {
        &self.session
    }
}

impl<T> Drop for MeshLink<T> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;
    use crate::protocol::packet::{BROADCAST, PayloadVariant};
    use crate::transport::mock::{MockHandle, MockTransport};
    use crate::types::MessageState;

    async fn connected_client() -> (MeshLink<MockTransport>, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let mut client = MeshLink::new(transport);
        client.connect().await.unwrap();
        (client, handle)
    }

    fn framed(packet: &Packet) -> Bytes {
        frame::encode(&packet.encode())
    }

    fn config_packet(leaf: ConfigLeaf) -> Packet {
        Packet {
            from: 1,
            to: 0,
            channel: 0,
            id: 40,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Config {
                leaf,
                data: Bytes::from_static(b"cfg"),
            },
        }
    }

    /// Receives events until one matches, with a timeout guard.
    async fn expect_event(
        events: &mut mpsc::UnboundedReceiver<Event>,
        matches: impl Fn(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let (transport, _handle) = MockTransport::new();
        let mut client = MeshLink::new(transport);
        let mut events = client.events();

        client.connect().await.unwrap();
        assert!(client.is_connected().await);
        let event = expect_event(&mut events, |e| matches!(e, Event::Connected)).await;
        assert!(matches!(event, Event::Connected));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let mut client = MeshLink::new(MockTransport::unreachable());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_config_session_reaches_completion() {
        let (client, handle) = connected_client().await;
        let mut events = client.events();

        assert_eq!(client.config_progress(), 0);
        for leaf in ConfigLeaf::ALL {
            handle.inbound.send(framed(&config_packet(leaf))).await.unwrap();
        }

        expect_event(&mut events, |e| matches!(e, Event::ConfigComplete)).await;
        assert!(client.is_configured());
        assert_eq!(client.config_progress(), 100);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_still_decodes() {
        let (client, handle) = connected_client().await;
        client.local_node.set(7);
        let mut events = client.events();

        let packet = Packet {
            from: 99,
            to: BROADCAST,
            channel: 0,
            id: 55,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Text("split delivery".into()),
        };
        let bytes = framed(&packet);
        let (head, tail) = bytes.split_at(5);
        handle.inbound.send(Bytes::copy_from_slice(head)).await.unwrap();
        handle.inbound.send(Bytes::copy_from_slice(tail)).await.unwrap();

        let event = expect_event(&mut events, |e| matches!(e, Event::Message(_))).await;
        let Event::Message(message) = event else {
            unreachable!()
        };
        assert_eq!(message.message, "split delivery");
        assert_eq!(message.state, MessageState::Ack);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_then_valid_frame() {
        let (client, handle) = connected_client().await;
        let mut events = client.events();

        handle
            .inbound
            .send(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
            .await
            .unwrap();
        let packet = Packet {
            from: 3,
            to: BROADCAST,
            channel: 0,
            id: 56,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Text("survived".into()),
        };
        handle.inbound.send(framed(&packet)).await.unwrap();

        let event = expect_event(&mut events, |e| matches!(e, Event::Message(_))).await;
        let Event::Message(message) = event else {
            unreachable!()
        };
        assert_eq!(message.message, "survived");
    }

    #[tokio::test]
    async fn test_link_death_cascades() {
        let (client, handle) = connected_client().await;
        let mut events = client.events();

        for leaf in [ConfigLeaf::Device, ConfigLeaf::Lora] {
            handle.inbound.send(framed(&config_packet(leaf))).await.unwrap();
        }
        expect_event(
            &mut events,
            |e| matches!(e, Event::ConfigUpdated { leaf } if *leaf == ConfigLeaf::Lora),
        )
        .await;
        assert!(client.config_progress() > 0);

        // The want-config handshake wrote first; drain it, then make sure
        // the ping is actually on the wire (and therefore registered)
        // before cutting the link.
        let mut handle = handle;
        let _ = handle.written.recv().await.unwrap();
        let session = Arc::clone(&client.session);
        let pending = tokio::spawn(async move { session.ping().await });
        let _ = handle.written.recv().await.unwrap();

        // Dropping the inbound sender closes the byte channel: link death.
        drop(handle.inbound);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
        expect_event(&mut events, |e| matches!(e, Event::Disconnected)).await;
        // Stale partial progress must not survive into the next session.
        assert_eq!(client.config_progress(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_resets_and_emits() {
        let (mut client, handle) = connected_client().await;
        let mut events = client.events();

        handle
            .inbound
            .send(framed(&config_packet(ConfigLeaf::Device)))
            .await
            .unwrap();
        expect_event(&mut events, |e| matches!(e, Event::ConfigUpdated { .. })).await;

        client.disconnect().await.unwrap();
        assert!(!client.is_connected().await);
        expect_event(&mut events, |e| matches!(e, Event::Disconnected)).await;
        assert_eq!(client.config_progress(), 0);
    }

    #[tokio::test]
    async fn test_on_config_complete_callback() {
        let (client, handle) = connected_client().await;
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            client.on_config_complete(move || {
                fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        let mut events = client.events();

        for leaf in ConfigLeaf::ALL {
            handle.inbound.send(framed(&config_packet(leaf))).await.unwrap();
        }
        expect_event(&mut events, |e| matches!(e, Event::ConfigComplete)).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_request_response() {
        let (client, mut handle) = connected_client().await;

        // Answer every written request (the want-config handshake and the
        // ping both) so the test is independent of write ordering.
        let responder = tokio::spawn(async move {
            while let Some(framed_request) = handle.written.recv().await {
                let request = crate::protocol::parser::parse_packet(
                    &framed_request[frame::HEADER_SIZE..],
                    0,
                )
                .unwrap();
                let response = Packet {
                    from: 1,
                    to: 0,
                    channel: 0,
                    id: 600,
                    request_id: request.id,
                    rx_time: 0,
                    payload: PayloadVariant::Admin {
                        opcode: crate::protocol::AdminOpcode::Pong as u8,
                        data: Bytes::new(),
                    },
                };
                if handle
                    .inbound
                    .send(frame::encode(&response.encode()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let response = client.ping().await.unwrap();
        assert!(matches!(response.payload, PayloadVariant::Admin { .. }));

        drop(client);
        responder.await.unwrap();
    }
}
