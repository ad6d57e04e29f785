use axl_core::{AXL_MAGIC, AxlError, Result, crc32};

use crate::FRAME_HEADER_SIZE;

pub const PROTOCOL_VERSION: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Session setup (0x01-0x0F)
    Hello = 0x01,
    HelloAck = 0x02,

    // Liveness (0x10-0x1F)
    Ping = 0x10,
    Pong = 0x11,

    // Membership (0x20-0x2F)
    DescribeCluster = 0x20,
    ClusterDescription = 0x21,

    // Opaque accelerator traffic (0x30-0x3F)
    Request = 0x30,
    Response = 0x31,

    ErrorResponse = 0xFF,
}

impl TryFrom<u8> for Command {
    type Error = AxlError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::Ping),
            0x11 => Ok(Self::Pong),
            0x20 => Ok(Self::DescribeCluster),
            0x21 => Ok(Self::ClusterDescription),
            0x30 => Ok(Self::Request),
            0x31 => Ok(Self::Response),
            0xFF => Ok(Self::ErrorResponse),
            other => Err(AxlError::Protocol(format!(
                "Unknown command byte: {:#04x}",
                other
            ))),
        }
    }
}

/// Fixed-size frame header
///
/// Layout (little endian):
/// `magic(4) version(1) command(1) flags(2) request_id(8) payload_len(4)
/// payload_crc(4) header_crc(4)`. The header CRC covers the first 24 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub command: Command,
    pub flags: u16,
    pub request_id: u64,
    pub payload_length: u32,
    pub payload_crc: u32,
}

impl FrameHeader {
    pub const SIZE: usize = FRAME_HEADER_SIZE;

    pub fn new(command: Command, request_id: u64, payload: Option<&[u8]>) -> Self {
        let (payload_length, payload_crc) = match payload {
            Some(p) => (p.len() as u32, crc32(p)),
            None => (0, 0),
        };

        Self {
            version: PROTOCOL_VERSION,
            command,
            flags: 0,
            request_id,
            payload_length,
            payload_crc,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(AxlError::Protocol("Buffer too small for frame header".into()));
        }

        if buf[0..4] != AXL_MAGIC {
            return Err(AxlError::InvalidMagic);
        }

        let stored_crc = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let computed_crc = crc32(&buf[0..24]);
        if stored_crc != computed_crc {
            return Err(AxlError::CrcMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(AxlError::Protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let mut request_id = [0u8; 8];
        request_id.copy_from_slice(&buf[8..16]);

        Ok(Self {
            version,
            command: Command::try_from(buf[5])?,
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            request_id: u64::from_le_bytes(request_id),
            payload_length: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            payload_crc: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&AXL_MAGIC);
        buf[4] = self.version;
        buf[5] = self.command as u8;
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_crc.to_le_bytes());
        let header_crc = crc32(&buf[0..24]);
        buf[24..28].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    pub fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        let actual = crc32(payload);
        if actual != self.payload_crc {
            return Err(AxlError::CrcMismatch {
                expected: self.payload_crc,
                actual,
            });
        }
        Ok(())
    }
}
