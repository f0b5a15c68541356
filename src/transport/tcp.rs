//! TCP transport implementation.
//!
//! Network-attached devices listen on port 4403 by default.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::transport::{READ_CHANNEL_CAPACITY, Transport, spawn_read_pump};

/// Default device TCP port.
pub const DEFAULT_PORT: u16 = 4403;

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Hostname or address of the device.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl TcpConfig {
    /// Creates a new TCP configuration with the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// TCP transport for network-attached devices.
///
/// Uses split read/write halves so reading and writing operate
/// concurrently; the read half feeds the pump spawned on connect.
pub struct TcpTransport {
    config: TcpConfig,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    reader_rx: Option<mpsc::Receiver<Bytes>>,
    pump: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            writer: None,
            reader_rx: None,
            pump: None,
        }
    }

    /// Creates a new TCP transport for the given host with default settings.
    #[must_use]
    pub fn with_host(host: impl Into<String>) -> Self {
        Self::new(TcpConfig::new(host))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            let target = format!("{}:{}", self.config.host, self.config.port);
            tracing::info!("connecting to {}", target);

            let stream = TcpStream::connect(&target)
                .await
                .map_err(|e| Error::Connection {
                    message: format!("{target}: {e}"),
                })?;

            // Frames are small and latency-sensitive.
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!("failed to set TCP_NODELAY: {}", e);
            }

            let (reader, writer) = stream.into_split();
            let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
            self.pump = Some(spawn_read_pump(reader, tx));
            self.reader_rx = Some(rx);
            self.writer = Some(Arc::new(Mutex::new(writer)));

            tracing::info!("connected to {}", target);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
            if self.writer.take().is_some() {
                tracing::info!("disconnected from {}", self.config.host);
            }
            self.reader_rx = None;
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let mut writer = writer.lock().await;

            tracing::trace!("sending {} bytes", data.len());
            writer.write_all(&data).await.map_err(Error::Io)?;
            writer.flush().await.map_err(Error::Io)?;

            Ok(())
        })
    }

    fn take_reader(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.reader_rx.take()
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}
