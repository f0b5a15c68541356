//! Transport layer for device communication.
//!
//! A transport owns one physical duplex link (TCP socket, serial port, or
//! BLE characteristic pair) and exposes it as two independent byte flows:
//! a write sink (`send`) and a read source (`take_reader`). Framing lives
//! outside the transport; what flows here is raw bytes.
//!
//! On connect, every transport spawns an internal read pump that forwards
//! byte chunks into a bounded channel. The bound is the backpressure
//! signal; the channel closing is how readers observe disconnection.

pub mod tcp;

#[cfg(feature = "ble")]
pub mod ble;

pub mod serial;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Capacity of the raw-byte channel between a transport's read pump and
/// the frame decoder. Bounded so a stalled consumer throttles the pump.
pub const READ_CHANNEL_CAPACITY: usize = 32;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Connects to the device.
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Disconnects from the device, releasing the underlying handle on all
    /// exit paths.
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Sends raw (already framed) bytes to the device.
    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Takes the inbound byte channel for use by the read loop.
    ///
    /// Yields `Some` exactly once per successful connect. The channel
    /// closes when the link drops.
    fn take_reader(&mut self) -> Option<mpsc::Receiver<Bytes>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

/// Spawns the read pump: copies byte chunks from the physical link into
/// the bounded channel until EOF, read error, or receiver drop.
pub(crate) fn spawn_read_pump<R>(mut reader: R, tx: mpsc::Sender<Bytes>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("transport read side closed");
                    break;
                }
                Ok(n) => {
                    tracing::trace!("received {} bytes", n);
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        tracing::debug!("byte receiver dropped");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("transport read error: {}", e);
                    break;
                }
            }
        }
    })
}

pub use tcp::TcpTransport;

#[cfg(feature = "ble")]
pub use ble::BleTransport;

pub use serial::SerialTransport;
