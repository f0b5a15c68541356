//! Packet model for the device protocol.
//!
//! A packet is one decoded frame: a fixed header followed by a tagged
//! payload variant. Header layout:
//!
//! ```text
//! [from:4LE] [to:4LE] [channel:1] [id:4LE] [request_id:4LE] [tag:1] [body...]
//! ```
//!
//! `request_id` is zero for unsolicited packets; a nonzero value marks the
//! packet as the response to an earlier request with that correlation id.
//! Unknown payload tags decode to [`PayloadVariant::Unknown`] so newer
//! firmware cannot crash the pipeline.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{NodeInfo, Position, Telemetry, Waypoint};

/// Reserved node address meaning "all nodes on channel".
pub const BROADCAST: u32 = 0xFFFF_FFFF;

/// Packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 18;

/// Coordinate scaling factor (degrees are carried as microdegrees).
pub(crate) const COORD_SCALE: f64 = 1_000_000.0;

/// Utilization scaling factor (percent carried as hundredths).
pub(crate) const UTIL_SCALE: f32 = 100.0;

/// Payload variant tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadTag {
    /// Text message.
    Text = 0x01,
    /// Map waypoint.
    Waypoint = 0x02,
    /// Admin request/response.
    Admin = 0x03,
    /// Telemetry snapshot.
    Telemetry = 0x04,
    /// Routing result (ack/nack) for an earlier packet.
    Routing = 0x05,
    /// Position report.
    Position = 0x06,
    /// Node information.
    NodeInfo = 0x07,
    /// Radio configuration leaf.
    Config = 0x08,
    /// Module configuration leaf.
    ModuleConfig = 0x09,
    /// The local node's own id.
    MyNodeInfo = 0x0A,
}

impl PayloadTag {
    /// Parses a payload tag from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Waypoint),
            0x03 => Some(Self::Admin),
            0x04 => Some(Self::Telemetry),
            0x05 => Some(Self::Routing),
            0x06 => Some(Self::Position),
            0x07 => Some(Self::NodeInfo),
            0x08 => Some(Self::Config),
            0x09 => Some(Self::ModuleConfig),
            0x0A => Some(Self::MyNodeInfo),
            _ => None,
        }
    }
}

/// One named unit of device configuration, tracked independently for
/// convergence purposes.
///
/// Radio leaves travel under the `Config` tag, module leaves under
/// `ModuleConfig`; the distinction is a wire detail only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigLeaf {
    /// Device role and hardware settings.
    Device,
    /// Position broadcast settings.
    Position,
    /// Power management.
    Power,
    /// Network (WiFi/Ethernet) settings.
    Network,
    /// Display settings.
    Display,
    /// LoRa radio parameters.
    Lora,
    /// Bluetooth settings.
    Bluetooth,
    /// Security keys and admin settings.
    Security,
    /// MQTT module.
    Mqtt,
    /// Serial module.
    Serial,
    /// Telemetry module.
    Telemetry,
    /// Store-and-forward module.
    StoreForward,
}

impl ConfigLeaf {
    /// Every leaf, in canonical (hash) order.
    pub const ALL: [Self; 12] = [
        Self::Device,
        Self::Position,
        Self::Power,
        Self::Network,
        Self::Display,
        Self::Lora,
        Self::Bluetooth,
        Self::Security,
        Self::Mqtt,
        Self::Serial,
        Self::Telemetry,
        Self::StoreForward,
    ];

    /// Number of leaves a full configuration session delivers.
    pub const COUNT: usize = Self::ALL.len();

    /// Returns true for module-config leaves.
    #[must_use]
    pub const fn is_module(self) -> bool {
        matches!(
            self,
            Self::Mqtt | Self::Serial | Self::Telemetry | Self::StoreForward
        )
    }

    /// The wire encoding of this leaf: payload tag plus leaf byte.
    #[must_use]
    pub const fn wire(self) -> (PayloadTag, u8) {
        match self {
            Self::Device => (PayloadTag::Config, 0),
            Self::Position => (PayloadTag::Config, 1),
            Self::Power => (PayloadTag::Config, 2),
            Self::Network => (PayloadTag::Config, 3),
            Self::Display => (PayloadTag::Config, 4),
            Self::Lora => (PayloadTag::Config, 5),
            Self::Bluetooth => (PayloadTag::Config, 6),
            Self::Security => (PayloadTag::Config, 7),
            Self::Mqtt => (PayloadTag::ModuleConfig, 0),
            Self::Serial => (PayloadTag::ModuleConfig, 1),
            Self::Telemetry => (PayloadTag::ModuleConfig, 2),
            Self::StoreForward => (PayloadTag::ModuleConfig, 3),
        }
    }

    /// Parses a leaf from its payload tag and leaf byte.
    #[must_use]
    pub const fn from_wire(tag: PayloadTag, byte: u8) -> Option<Self> {
        match (tag, byte) {
            (PayloadTag::Config, 0) => Some(Self::Device),
            (PayloadTag::Config, 1) => Some(Self::Position),
            (PayloadTag::Config, 2) => Some(Self::Power),
            (PayloadTag::Config, 3) => Some(Self::Network),
            (PayloadTag::Config, 4) => Some(Self::Display),
            (PayloadTag::Config, 5) => Some(Self::Lora),
            (PayloadTag::Config, 6) => Some(Self::Bluetooth),
            (PayloadTag::Config, 7) => Some(Self::Security),
            (PayloadTag::ModuleConfig, 0) => Some(Self::Mqtt),
            (PayloadTag::ModuleConfig, 1) => Some(Self::Serial),
            (PayloadTag::ModuleConfig, 2) => Some(Self::Telemetry),
            (PayloadTag::ModuleConfig, 3) => Some(Self::StoreForward),
            _ => None,
        }
    }

    /// Human-readable leaf name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Position => "position",
            Self::Power => "power",
            Self::Network => "network",
            Self::Display => "display",
            Self::Lora => "lora",
            Self::Bluetooth => "bluetooth",
            Self::Security => "security",
            Self::Mqtt => "mqtt",
            Self::Serial => "serial",
            Self::Telemetry => "telemetry",
            Self::StoreForward => "store_forward",
        }
    }
}

/// The tagged payload carried by a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadVariant {
    /// Text message.
    Text(String),
    /// Map waypoint.
    Waypoint(Waypoint),
    /// Admin request or response body.
    Admin {
        /// Admin operation code.
        opcode: u8,
        /// Operation-specific data.
        data: Bytes,
    },
    /// Telemetry snapshot.
    Telemetry(Telemetry),
    /// Routing result; `error_code` 0 is an acknowledgement, anything else
    /// a negative acknowledgement reason.
    Routing {
        /// Zero for ack, nonzero nack reason.
        error_code: u8,
    },
    /// Position report.
    Position(Position),
    /// Node information.
    NodeInfo(NodeInfo),
    /// A configuration leaf (radio or module).
    Config {
        /// Which leaf this chunk carries.
        leaf: ConfigLeaf,
        /// Opaque leaf payload.
        data: Bytes,
    },
    /// The local node's own id, sent early in a configuration session.
    MyNodeInfo {
        /// The local node id.
        node_id: u32,
    },
    /// A payload variant this library does not know. Preserved, never an
    /// error.
    Unknown {
        /// The unrecognized tag byte.
        tag: u8,
        /// Raw body bytes.
        data: Bytes,
    },
}

impl PayloadVariant {
    /// The wire tag byte for this variant.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Text(_) => PayloadTag::Text as u8,
            Self::Waypoint(_) => PayloadTag::Waypoint as u8,
            Self::Admin { .. } => PayloadTag::Admin as u8,
            Self::Telemetry(_) => PayloadTag::Telemetry as u8,
            Self::Routing { .. } => PayloadTag::Routing as u8,
            Self::Position(_) => PayloadTag::Position as u8,
            Self::NodeInfo(_) => PayloadTag::NodeInfo as u8,
            Self::Config { leaf, .. } => leaf.wire().0 as u8,
            Self::MyNodeInfo { .. } => PayloadTag::MyNodeInfo as u8,
            Self::Unknown { tag, .. } => *tag,
        }
    }
}

/// A decoded protocol packet.
///
/// Immutable after creation; `rx_time` is stamped by the router at decode
/// time and is not carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Source node id.
    pub from: u32,
    /// Destination node id, or [`BROADCAST`].
    pub to: u32,
    /// Channel index.
    pub channel: u8,
    /// Packet id, unique per sender while in flight.
    pub id: u32,
    /// Correlation id of the request this packet answers (0 = none).
    pub request_id: u32,
    /// Receipt timestamp (Unix seconds).
    pub rx_time: u32,
    /// Payload.
    pub payload: PayloadVariant,
}

impl Packet {
    /// Returns true if the packet targets the broadcast sentinel.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Returns true if the packet is a response correlated to a request.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        self.request_id != 0
    }

    /// Encodes the packet (header + payload body) into unframed bytes.
    ///
    /// The result still needs [`frame::encode`](super::frame::encode)
    /// before hitting the wire.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + 32);
        buf.put_u32_le(self.from);
        buf.put_u32_le(self.to);
        buf.put_u8(self.channel);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.request_id);
        buf.put_u8(self.payload.tag());
        encode_payload(&self.payload, &mut buf);
        buf.freeze()
    }
}

/// Truncates a string to what a u8 length prefix can carry.
fn clamp_str(s: &str) -> &[u8] {
    let bytes = s.as_bytes();
    &bytes[..bytes.len().min(255)]
}

/// Encodes a latitude/longitude in microdegrees.
fn put_coord(buf: &mut BytesMut, degrees: f64) {
    buf.put_i32_le((degrees * COORD_SCALE).round() as i32);
}

fn encode_payload(payload: &PayloadVariant, buf: &mut BytesMut) {
    match payload {
        PayloadVariant::Text(text) => buf.put_slice(text.as_bytes()),
        PayloadVariant::Waypoint(wp) => {
            buf.put_u32_le(wp.id);
            put_coord(buf, wp.latitude);
            put_coord(buf, wp.longitude);
            let name = clamp_str(&wp.name);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
        }
        PayloadVariant::Admin { opcode, data } => {
            buf.put_u8(*opcode);
            buf.put_slice(data);
        }
        PayloadVariant::Telemetry(t) => {
            buf.put_u8(t.battery_level);
            buf.put_u32_le(t.voltage_mv);
            buf.put_u16_le((t.channel_utilization * UTIL_SCALE).round() as u16);
            buf.put_u16_le((t.air_utilization * UTIL_SCALE).round() as u16);
        }
        PayloadVariant::Routing { error_code } => buf.put_u8(*error_code),
        PayloadVariant::Position(p) => {
            put_coord(buf, p.latitude);
            put_coord(buf, p.longitude);
            buf.put_i32_le(p.altitude);
            buf.put_u32_le(p.time);
        }
        PayloadVariant::NodeInfo(n) => {
            buf.put_u32_le(n.node_id);
            let short = clamp_str(&n.short_name);
            buf.put_u8(short.len() as u8);
            buf.put_slice(short);
            let long = clamp_str(&n.long_name);
            buf.put_u8(long.len() as u8);
            buf.put_slice(long);
        }
        PayloadVariant::Config { leaf, data } => {
            buf.put_u8(leaf.wire().1);
            buf.put_slice(data);
        }
        PayloadVariant::MyNodeInfo { node_id } => buf.put_u32_le(*node_id),
        PayloadVariant::Unknown { data, .. } => buf.put_slice(data),
    }
}
