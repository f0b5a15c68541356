//! # meshlink
//!
//! An async Rust client library for mesh-radio devices.
//!
//! This library frames an unbounded byte stream into discrete protocol
//! frames, multiplexes concurrent request/response exchanges over a single
//! physical link (TCP, serial, or Bluetooth LE), tracks device
//! configuration convergence, and converts raw device packets into typed
//! application events.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Split-boundary-tolerant frame codec with corruption resynchronization
//! - Correlation-id request multiplexing with per-request timeouts
//! - Configuration convergence tracking with leaf/root hashing
//! - Ordered, synchronous packet fan-out to subscribers
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshlink::{Destination, MeshLink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshlink::Error> {
//!     // Connect to a network-attached device (default port 4403)
//!     let mut client = MeshLink::tcp("meshnode.local");
//!     client.connect().await?;
//!
//!     // Wait for the configuration session to converge
//!     client.on_config_complete(|| println!("device configured"));
//!
//!     // Send a text message to node 42 on channel 0
//!     let message = client.send_text(Destination::Node(42), 0, "hi").await?;
//!     println!("message {} is {:?}", message.message_id, message.state);
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Frame codec, packet model, payload parsing, admin ops
//! - [`transport`] - Transport implementations (TCP, serial, BLE)
//! - [`router`] - Packet classification and ordered event dispatch
//! - [`session`] - Request/response multiplexing with timeouts
//! - [`config_sync`] - Configuration convergence tracking
//! - [`pipeline`] - Message pipeline and delivery-state tracking
//! - [`types`] - Data structures (messages, nodes, telemetry)
//! - [`client`] - High-level [`MeshLink`] client

pub mod client;
pub mod config_sync;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::MeshLink;
pub use config_sync::{ConfigSnapshot, ConfigSync};
pub use error::{Error, FrameError, Result};
pub use pipeline::{MessagePipeline, PipelineEvent};
pub use protocol::{AdminOpcode, BROADCAST, ConfigLeaf, Packet, PayloadTag, PayloadVariant};
pub use router::{Event, PacketRouter, Topic};
pub use session::RequestSession;
pub use transport::{SerialTransport, TcpTransport, Transport, serial::list_ports};
pub use types::{
    Destination, LocalNode, Message, MessageKind, MessageState, NodeInfo, Position, Telemetry,
    Waypoint,
};

#[cfg(feature = "ble")]
pub use transport::BleTransport;

/// Gets the current Unix timestamp as a u32.
pub(crate) fn current_timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
