//! Request/response session multiplexing.
//!
//! The session pipelines many outstanding requests onto the single
//! transport link and matches responses back by correlation id. Each
//! outstanding request is a oneshot channel in the pending map; the packet
//! router resolves it via [`RequestSession::complete`] when the correlated
//! response arrives.
//!
//! Per-request state machine: sent → acknowledged | timed out | errored
//! (all terminal). The session never retries on its own; a timed-out id is
//! released immediately so a caller-initiated retry gets fresh correlation
//! space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

use crate::error::{Error, Result};
use crate::protocol::packet::{ConfigLeaf, Packet, PayloadVariant};
use crate::protocol::{admin, frame};
use crate::transport::Transport;
use crate::types::LocalNode;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Multiplexes admin/config requests over one transport.
pub struct RequestSession<T> {
    transport: Arc<Mutex<T>>,
    local_node: Arc<LocalNode>,
    pending: StdMutex<HashMap<u32, oneshot::Sender<Packet>>>,
    next_id: AtomicU32,
    timeout: Duration,
}

impl<T: Transport> RequestSession<T> {
    /// Creates a new session over the given transport.
    #[must_use]
    pub fn new(transport: Arc<Mutex<T>>, local_node: Arc<LocalNode>) -> Self {
        Self {
            transport,
            local_node,
            pending: StdMutex::new(HashMap::new()),
            // Correlation ids are even and never zero; message ids are odd.
            // The two spaces cannot collide.
            next_id: AtomicU32::new(2),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the default request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Allocates a fresh even correlation id.
    fn next_request_id(&self) -> u32 {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        // Wrapping back over zero is unreachable in practice but must not
        // mint the no-correlation sentinel.
        if id == 0 { self.next_request_id() } else { id }
    }

    /// Sends a request and waits for its correlated response.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if no response arrives within `timeout`; the id
    ///   is released before returning.
    /// - `Error::ConnectionLost` if the transport drops while the request
    ///   is outstanding.
    pub async fn request_with_timeout(
        &self,
        payload: PayloadVariant,
        timeout: Duration,
    ) -> Result<Packet> {
        let id = self.next_request_id();
        let (response_tx, response_rx) = oneshot::channel();

        // Register BEFORE sending: a fast device could answer before this
        // task runs again, and the router must already find the entry.
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(id, response_tx);
        }

        let packet = Packet {
            from: self.local_node.id_or_zero(),
            // Admin requests are self-addressed to the attached node.
            to: self.local_node.id_or_zero(),
            channel: 0,
            id,
            request_id: 0,
            rx_time: 0,
            payload,
        };
        let framed = frame::encode(&packet.encode());

        let send_result = {
            let mut transport = self.transport.lock().await;
            transport.send(framed).await
        };
        if let Err(e) = send_result {
            self.remove_pending(id);
            return Err(e);
        }

        tokio::select! {
            biased;
            response = response_rx => match response {
                Ok(packet) => Ok(packet),
                // The sender was dropped without a response: fail_all ran.
                Err(_) => Err(Error::ConnectionLost),
            },
            () = tokio::time::sleep(timeout) => {
                self.remove_pending(id);
                Err(Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Sends a request with the default timeout.
    pub async fn request(&self, payload: PayloadVariant) -> Result<Packet> {
        self.request_with_timeout(payload, self.timeout).await
    }

    /// Delivers a correlated response to its waiting request.
    ///
    /// Returns true if a pending request consumed the packet; the router
    /// stops fan-out in that case.
    pub fn complete(&self, request_id: u32, packet: Packet) -> bool {
        let sender = self.remove_pending(request_id);
        match sender {
            Some(sender) => {
                // A dropped receiver means the caller gave up (timeout
                // raced the response); the packet is discarded either way.
                let _ = sender.send(packet);
                true
            }
            None => false,
        }
    }

    /// Returns true if a request with this correlation id is outstanding.
    #[must_use]
    pub fn is_pending(&self, request_id: u32) -> bool {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .contains_key(&request_id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Rejects every outstanding request with `ConnectionLost`.
    ///
    /// Called when the transport drops; no request is left to hang.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!("failing {} outstanding requests", drained.len());
        }
        // Dropping the senders resolves each receiver with ConnectionLost.
        drop(drained);
    }

    fn remove_pending(&self, id: u32) -> Option<oneshot::Sender<Packet>> {
        self.pending.lock().expect("pending map poisoned").remove(&id)
    }

    // ==================== Admin Requests ====================

    /// Asks the device to stream its full configuration.
    pub async fn want_config(&self) -> Result<Packet> {
        self.request(admin::want_config()).await
    }

    /// Reads one configuration leaf.
    pub async fn get_config(&self, leaf: ConfigLeaf) -> Result<Packet> {
        self.request(admin::get_config(leaf)).await
    }

    /// Writes one configuration leaf.
    pub async fn set_config(&self, leaf: ConfigLeaf, value: &[u8]) -> Result<Packet> {
        self.request(admin::set_config(leaf, value)).await
    }

    /// Reboots the device.
    pub async fn reboot(&self) -> Result<Packet> {
        self.request(admin::reboot()).await
    }

    /// Probes device liveness.
    pub async fn ping(&self) -> Result<Packet> {
        self.request(admin::ping()).await
    }

    /// Reads device metadata.
    pub async fn get_metadata(&self) -> Result<Packet> {
        self.request(admin::get_metadata()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::HEADER_SIZE;
    use crate::protocol::parser::parse_packet;
    use crate::transport::mock::{MockHandle, MockTransport};
    use bytes::Bytes;

    async fn connected_session() -> (Arc<RequestSession<MockTransport>>, MockHandle) {
        let (mut transport, handle) = MockTransport::new();
        transport.connect().await.unwrap();
        let session = Arc::new(RequestSession::new(
            Arc::new(Mutex::new(transport)),
            Arc::new(LocalNode::new()),
        ));
        (session, handle)
    }

    /// Decodes the request the session just wrote to the transport.
    fn written_request(framed: &Bytes) -> Packet {
        parse_packet(&framed[HEADER_SIZE..], 0).unwrap()
    }

    fn response_to(request: &Packet, payload: PayloadVariant) -> Packet {
        Packet {
            from: 1,
            to: request.from,
            channel: 0,
            id: 900 + request.id,
            request_id: request.id,
            rx_time: 0,
            payload,
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_response() {
        let (session, mut handle) = connected_session().await;

        let responder = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let frame = handle.written.recv().await.unwrap();
                let request = written_request(&frame);
                session.complete(
                    request.id,
                    response_to(&request, PayloadVariant::Routing { error_code: 0 }),
                );
            })
        };

        let response = session.ping().await.unwrap();
        assert!(matches!(
            response.payload,
            PayloadVariant::Routing { error_code: 0 }
        ));
        assert_eq!(session.pending_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_no_cross_talk() {
        let (session, mut handle) = connected_session().await;

        let responder = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let first = written_request(&handle.written.recv().await.unwrap());
                let second = written_request(&handle.written.recv().await.unwrap());
                // Answer in reverse order; each future must still get its
                // own response.
                session.complete(
                    second.id,
                    response_to(&second, PayloadVariant::Text("second".into())),
                );
                session.complete(
                    first.id,
                    response_to(&first, PayloadVariant::Text("first".into())),
                );
            })
        };

        let (a, b) = tokio::join!(
            session.request(admin::ping()),
            session.request(admin::get_metadata()),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.payload, PayloadVariant::Text("first".into()));
        assert_eq!(b.payload, PayloadVariant::Text("second".into()));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_releases_id() {
        let (session, mut handle) = connected_session().await;

        let err = session
            .request_with_timeout(admin::ping(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 100 }));
        assert_eq!(session.pending_count(), 0);

        // The id must be immediately reusable: a late response for it is
        // simply not pending any more.
        let request = written_request(&handle.written.recv().await.unwrap());
        assert!(!session.is_pending(request.id));
        assert!(!session.complete(
            request.id,
            response_to(&request, PayloadVariant::Routing { error_code: 0 })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_all_outstanding() {
        let (session, mut handle) = connected_session().await;

        let waiters = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::join!(session.ping(), session.get_metadata())
            })
        };

        // Both requests must be on the wire before the cut.
        let _ = handle.written.recv().await.unwrap();
        let _ = handle.written.recv().await.unwrap();
        session.fail_all();

        let (a, b) = waiters.await.unwrap();
        assert!(matches!(a.unwrap_err(), Error::ConnectionLost));
        assert!(matches!(b.unwrap_err(), Error::ConnectionLost));
    }

    #[tokio::test]
    async fn test_correlation_ids_distinct_and_even() {
        let (session, mut handle) = connected_session().await;

        let requests = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let _ = tokio::join!(
                    session.request_with_timeout(admin::ping(), Duration::from_millis(10)),
                    session.request_with_timeout(admin::ping(), Duration::from_millis(10)),
                    session.request_with_timeout(admin::ping(), Duration::from_millis(10)),
                );
            })
        };

        let mut seen = Vec::new();
        for _ in 0..3 {
            let request = written_request(&handle.written.recv().await.unwrap());
            assert_eq!(request.id % 2, 0);
            assert_ne!(request.id, 0);
            seen.push(request.id);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3);
        requests.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_releases_pending() {
        let (transport, _handle) = MockTransport::new();
        // Never connected: send fails immediately.
        let session = RequestSession::new(
            Arc::new(Mutex::new(transport)),
            Arc::new(LocalNode::new()),
        );

        let err = session.ping().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(session.pending_count(), 0);
    }
}
