//! Binary payload parsing for the device protocol.
//!
//! Parsers follow a common shape: check the minimum length up front,
//! then walk the body with a [`bytes::Buf`] cursor. A malformed body is a
//! protocol error the router logs and drops; an unrecognized variant tag
//! or config leaf byte is *not* an error and decodes to
//! [`PayloadVariant::Unknown`] for forward compatibility.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};
use crate::protocol::packet::{
    COORD_SCALE, ConfigLeaf, PACKET_HEADER_SIZE, Packet, PayloadTag, PayloadVariant, UTIL_SCALE,
};
use crate::types::{NodeInfo, Position, Telemetry, Waypoint};

/// Parses a packet from an unframed payload, stamping `rx_time`.
pub fn parse_packet(data: &[u8], rx_time: u32) -> Result<Packet> {
    if data.len() < PACKET_HEADER_SIZE {
        return Err(Error::Protocol {
            message: format!("packet too short: {} bytes", data.len()),
        });
    }

    let mut cursor = std::io::Cursor::new(data);
    let from = cursor.get_u32_le();
    let to = cursor.get_u32_le();
    let channel = cursor.get_u8();
    let id = cursor.get_u32_le();
    let request_id = cursor.get_u32_le();
    let tag_byte = cursor.get_u8();

    let body = &data[PACKET_HEADER_SIZE..];
    let payload = parse_payload(tag_byte, body)?;

    Ok(Packet {
        from,
        to,
        channel,
        id,
        request_id,
        rx_time,
        payload,
    })
}

/// Parses a payload body according to its tag byte.
pub fn parse_payload(tag_byte: u8, body: &[u8]) -> Result<PayloadVariant> {
    let Some(tag) = PayloadTag::from_byte(tag_byte) else {
        return Ok(PayloadVariant::Unknown {
            tag: tag_byte,
            data: Bytes::copy_from_slice(body),
        });
    };

    match tag {
        PayloadTag::Text => Ok(PayloadVariant::Text(
            String::from_utf8_lossy(body).into_owned(),
        )),
        PayloadTag::Waypoint => parse_waypoint(body),
        PayloadTag::Admin => {
            if body.is_empty() {
                return Err(Error::Protocol {
                    message: "admin body empty".into(),
                });
            }
            Ok(PayloadVariant::Admin {
                opcode: body[0],
                data: Bytes::copy_from_slice(&body[1..]),
            })
        }
        PayloadTag::Telemetry => parse_telemetry(body),
        PayloadTag::Routing => {
            if body.is_empty() {
                return Err(Error::Protocol {
                    message: "routing body empty".into(),
                });
            }
            Ok(PayloadVariant::Routing {
                error_code: body[0],
            })
        }
        PayloadTag::Position => parse_position(body),
        PayloadTag::NodeInfo => parse_node_info(body),
        PayloadTag::Config | PayloadTag::ModuleConfig => {
            if body.is_empty() {
                return Err(Error::Protocol {
                    message: "config body empty".into(),
                });
            }
            // An unknown leaf byte means newer firmware; preserve it
            // rather than failing.
            match ConfigLeaf::from_wire(tag, body[0]) {
                Some(leaf) => Ok(PayloadVariant::Config {
                    leaf,
                    data: Bytes::copy_from_slice(&body[1..]),
                }),
                None => Ok(PayloadVariant::Unknown {
                    tag: tag_byte,
                    data: Bytes::copy_from_slice(body),
                }),
            }
        }
        PayloadTag::MyNodeInfo => {
            if body.len() < 4 {
                return Err(Error::Protocol {
                    message: format!("my-node-info too short: {} bytes", body.len()),
                });
            }
            Ok(PayloadVariant::MyNodeInfo {
                node_id: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            })
        }
    }
}

/// Parses a microdegree coordinate back to decimal degrees.
fn parse_coord(value: i32) -> f64 {
    f64::from(value) / COORD_SCALE
}

/// Parses a u8-length-prefixed string.
fn parse_lp_string(cursor: &mut std::io::Cursor<&[u8]>) -> Result<String> {
    if cursor.remaining() < 1 {
        return Err(Error::Protocol {
            message: "string length missing".into(),
        });
    }
    let len = usize::from(cursor.get_u8());
    if cursor.remaining() < len {
        return Err(Error::Protocol {
            message: format!("string truncated: need {len}, got {}", cursor.remaining()),
        });
    }
    let raw = cursor.copy_to_bytes(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Format: `[id:4LE] [lat:4LE] [lon:4LE] [name_len:1] [name...]`
fn parse_waypoint(body: &[u8]) -> Result<PayloadVariant> {
    if body.len() < 13 {
        return Err(Error::Protocol {
            message: format!("waypoint too short: {} bytes", body.len()),
        });
    }
    let mut cursor = std::io::Cursor::new(body);
    let id = cursor.get_u32_le();
    let latitude = parse_coord(cursor.get_i32_le());
    let longitude = parse_coord(cursor.get_i32_le());
    let name = parse_lp_string(&mut cursor)?;

    Ok(PayloadVariant::Waypoint(Waypoint {
        id,
        latitude,
        longitude,
        name,
    }))
}

/// Format: `[battery:1] [voltage_mv:4LE] [ch_util_x100:2LE] [air_util_x100:2LE]`
fn parse_telemetry(body: &[u8]) -> Result<PayloadVariant> {
    if body.len() < 9 {
        return Err(Error::Protocol {
            message: format!("telemetry too short: {} bytes", body.len()),
        });
    }
    let mut cursor = std::io::Cursor::new(body);
    let battery_level = cursor.get_u8();
    let voltage_mv = cursor.get_u32_le();
    let channel_utilization = f32::from(cursor.get_u16_le()) / UTIL_SCALE;
    let air_utilization = f32::from(cursor.get_u16_le()) / UTIL_SCALE;

    Ok(PayloadVariant::Telemetry(Telemetry {
        battery_level,
        voltage_mv,
        channel_utilization,
        air_utilization,
    }))
}

/// Format: `[lat:4LE] [lon:4LE] [alt:4LE] [time:4LE]`
fn parse_position(body: &[u8]) -> Result<PayloadVariant> {
    if body.len() < 16 {
        return Err(Error::Protocol {
            message: format!("position too short: {} bytes", body.len()),
        });
    }
    let mut cursor = std::io::Cursor::new(body);
    let latitude = parse_coord(cursor.get_i32_le());
    let longitude = parse_coord(cursor.get_i32_le());
    let altitude = cursor.get_i32_le();
    let time = cursor.get_u32_le();

    Ok(PayloadVariant::Position(Position {
        latitude,
        longitude,
        altitude,
        time,
    }))
}

/// Format: `[node:4LE] [short_len:1] [short...] [long_len:1] [long...]`
fn parse_node_info(body: &[u8]) -> Result<PayloadVariant> {
    if body.len() < 6 {
        return Err(Error::Protocol {
            message: format!("node-info too short: {} bytes", body.len()),
        });
    }
    let mut cursor = std::io::Cursor::new(body);
    let node_id = cursor.get_u32_le();
    let short_name = parse_lp_string(&mut cursor)?;
    let long_name = parse_lp_string(&mut cursor)?;

    Ok(PayloadVariant::NodeInfo(NodeInfo {
        node_id,
        short_name,
        long_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::BROADCAST;

    fn roundtrip(payload: PayloadVariant) -> Packet {
        let packet = Packet {
            from: 7,
            to: 42,
            channel: 1,
            id: 1000,
            request_id: 0,
            rx_time: 0,
            payload,
        };
        let decoded = parse_packet(&packet.encode(), 0).unwrap();
        assert_eq!(decoded, packet);
        decoded
    }

    #[test]
    fn test_text_roundtrip() {
        roundtrip(PayloadVariant::Text("hello mesh".into()));
    }

    #[test]
    fn test_waypoint_roundtrip() {
        roundtrip(PayloadVariant::Waypoint(Waypoint {
            id: 5,
            latitude: 52.52,
            longitude: 13.405,
            name: "camp".into(),
        }));
    }

    #[test]
    fn test_admin_roundtrip() {
        roundtrip(PayloadVariant::Admin {
            opcode: 0x02,
            data: Bytes::from_static(&[1, 2, 3]),
        });
    }

    #[test]
    fn test_telemetry_roundtrip() {
        roundtrip(PayloadVariant::Telemetry(Telemetry {
            battery_level: 88,
            voltage_mv: 3700,
            channel_utilization: 12.5,
            air_utilization: 3.25,
        }));
    }

    #[test]
    fn test_node_info_roundtrip() {
        roundtrip(PayloadVariant::NodeInfo(NodeInfo {
            node_id: 99,
            short_name: "N99".into(),
            long_name: "node ninety-nine".into(),
        }));
    }

    #[test]
    fn test_config_leaf_roundtrip() {
        for leaf in ConfigLeaf::ALL {
            roundtrip(PayloadVariant::Config {
                leaf,
                data: Bytes::from_static(&[0xAA, 0xBB]),
            });
        }
    }

    #[test]
    fn test_unknown_tag_preserved() {
        let packet = Packet {
            from: 1,
            to: BROADCAST,
            channel: 0,
            id: 2,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Unknown {
                tag: 0x7F,
                data: Bytes::from_static(&[9, 9, 9]),
            },
        };
        let decoded = parse_packet(&packet.encode(), 0).unwrap();
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_unknown_config_leaf_becomes_unknown() {
        let mut raw = Packet {
            from: 1,
            to: 2,
            channel: 0,
            id: 3,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Config {
                leaf: ConfigLeaf::Lora,
                data: Bytes::from_static(&[1]),
            },
        }
        .encode()
        .to_vec();
        raw[PACKET_HEADER_SIZE] = 0x63; // leaf byte nothing maps to

        let decoded = parse_packet(&raw, 0).unwrap();
        assert!(matches!(
            decoded.payload,
            PayloadVariant::Unknown { tag, .. } if tag == PayloadTag::Config as u8
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = parse_packet(&[0u8; 5], 0).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut raw = Packet {
            from: 1,
            to: 2,
            channel: 0,
            id: 3,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::NodeInfo(NodeInfo {
                node_id: 4,
                short_name: "abc".into(),
                long_name: "abcdef".into(),
            }),
        }
        .encode()
        .to_vec();
        raw.truncate(raw.len() - 3);

        assert!(parse_packet(&raw, 0).is_err());
    }

    #[test]
    fn test_rx_time_stamped() {
        let raw = Packet {
            from: 1,
            to: 2,
            channel: 0,
            id: 3,
            request_id: 0,
            rx_time: 0,
            payload: PayloadVariant::Text("t".into()),
        }
        .encode();
        let decoded = parse_packet(&raw, 1_700_000_000).unwrap();
        assert_eq!(decoded.rx_time, 1_700_000_000);
    }
}
