//! Protocol definitions for device communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding
//! - The packet model and payload variants
//! - Binary payload parsing
//! - Admin operation codes and request builders

pub mod admin;
pub mod frame;
pub mod packet;
pub mod parser;

pub use admin::AdminOpcode;
pub use frame::{FrameDecoder, MAX_FRAME_PAYLOAD, encode as encode_frame};
pub use packet::{BROADCAST, ConfigLeaf, Packet, PayloadTag, PayloadVariant};
pub use parser::{parse_packet, parse_payload};
