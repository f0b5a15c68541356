//! Node, position, telemetry, and waypoint data.

use std::sync::atomic::{AtomicU32, Ordering};

/// The local node's id, learned from the device during the configuration
/// handshake and shared across the session and pipeline.
///
/// Zero means "not yet known" (node id 0 is not a valid mesh address).
#[derive(Debug, Default)]
pub struct LocalNode(AtomicU32);

impl LocalNode {
    /// Creates an unset local node handle.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Records the local node id.
    pub fn set(&self, node_id: u32) {
        self.0.store(node_id, Ordering::SeqCst);
    }

    /// Returns the local node id if known.
    #[must_use]
    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Returns the local node id, or zero when unknown.
    #[must_use]
    pub fn id_or_zero(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Information about a node on the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node identifier.
    pub node_id: u32,
    /// Short display name (up to 4 characters by convention).
    pub short_name: String,
    /// Long display name.
    pub long_name: String,
}

/// A geographic position report.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude in metres.
    pub altitude: i32,
    /// Fix timestamp (Unix seconds).
    pub time: u32,
}

/// Device telemetry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Battery level in percent (101 = powered).
    pub battery_level: u8,
    /// Battery voltage in millivolts.
    pub voltage_mv: u32,
    /// Channel utilization in percent.
    pub channel_utilization: f32,
    /// Airtime utilization (TX) in percent.
    pub air_utilization: f32,
}

/// A shared map waypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    /// Waypoint identifier.
    pub id: u32,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Waypoint name.
    pub name: String,
}
