//! Admin operation codes and request body builders.
//!
//! Admin exchanges ride inside [`PayloadVariant::Admin`] packets with a
//! nonzero correlation id; the session layer matches responses back to the
//! issuing request.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packet::{ConfigLeaf, PayloadVariant};

/// Admin operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminOpcode {
    /// Ask the device to stream its full configuration.
    WantConfig = 0x01,
    /// Read one configuration leaf.
    GetConfig = 0x02,
    /// Response carrying one configuration leaf value.
    ConfigValue = 0x03,
    /// Write one configuration leaf.
    SetConfig = 0x04,
    /// Reboot the device.
    Reboot = 0x05,
    /// Liveness probe.
    Ping = 0x06,
    /// Liveness probe response.
    Pong = 0x07,
    /// Read device metadata (firmware version, hardware model).
    GetMetadata = 0x08,
    /// Response carrying device metadata.
    Metadata = 0x09,
}

impl AdminOpcode {
    /// Parses an admin opcode from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::WantConfig),
            0x02 => Some(Self::GetConfig),
            0x03 => Some(Self::ConfigValue),
            0x04 => Some(Self::SetConfig),
            0x05 => Some(Self::Reboot),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::Pong),
            0x08 => Some(Self::GetMetadata),
            0x09 => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// Builds a want-config request; the device answers with its node id and a
/// stream of configuration leaves.
#[must_use]
pub fn want_config() -> PayloadVariant {
    PayloadVariant::Admin {
        opcode: AdminOpcode::WantConfig as u8,
        data: Bytes::new(),
    }
}

/// Builds a request for one configuration leaf.
#[must_use]
pub fn get_config(leaf: ConfigLeaf) -> PayloadVariant {
    let (tag, byte) = leaf.wire();
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u8(tag as u8);
    buf.put_u8(byte);
    PayloadVariant::Admin {
        opcode: AdminOpcode::GetConfig as u8,
        data: buf.freeze(),
    }
}

/// Builds a write of one configuration leaf.
#[must_use]
pub fn set_config(leaf: ConfigLeaf, value: &[u8]) -> PayloadVariant {
    let (tag, byte) = leaf.wire();
    let mut buf = BytesMut::with_capacity(2 + value.len());
    buf.put_u8(tag as u8);
    buf.put_u8(byte);
    buf.put_slice(value);
    PayloadVariant::Admin {
        opcode: AdminOpcode::SetConfig as u8,
        data: buf.freeze(),
    }
}

/// Builds a reboot request.
///
/// The literal "reboot" body is required by the firmware as a safety
/// measure against stray opcodes.
#[must_use]
pub fn reboot() -> PayloadVariant {
    PayloadVariant::Admin {
        opcode: AdminOpcode::Reboot as u8,
        data: Bytes::from_static(b"reboot"),
    }
}

/// Builds a liveness probe.
#[must_use]
pub fn ping() -> PayloadVariant {
    PayloadVariant::Admin {
        opcode: AdminOpcode::Ping as u8,
        data: Bytes::new(),
    }
}

/// Builds a device metadata request.
#[must_use]
pub fn get_metadata() -> PayloadVariant {
    PayloadVariant::Admin {
        opcode: AdminOpcode::GetMetadata as u8,
        data: Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0x01..=0x09 {
            let opcode = AdminOpcode::from_byte(byte).unwrap();
            assert_eq!(opcode as u8, byte);
        }
        assert_eq!(AdminOpcode::from_byte(0x7f), None);
    }

    #[test]
    fn test_get_config_body() {
        let PayloadVariant::Admin { opcode, data } = get_config(ConfigLeaf::Lora) else {
            panic!("expected admin payload");
        };
        assert_eq!(opcode, AdminOpcode::GetConfig as u8);
        let (tag, byte) = ConfigLeaf::Lora.wire();
        assert_eq!(&data[..], &[tag as u8, byte]);
    }

    #[test]
    fn test_reboot_carries_guard_string() {
        let PayloadVariant::Admin { data, .. } = reboot() else {
            panic!("expected admin payload");
        };
        assert_eq!(&data[..], b"reboot");
    }
}
