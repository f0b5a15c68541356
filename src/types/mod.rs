//! Data types for meshlink entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Messages and delivery state
//! - Node, position, telemetry, and waypoint data

pub mod device;
pub mod message;

pub use device::{LocalNode, NodeInfo, Position, Telemetry, Waypoint};
pub use message::{Destination, Message, MessageKind, MessageState};
