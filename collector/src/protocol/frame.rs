//! Frame layout shared by device reports and server responses:
//!
//! ```text
//! ┌──────────┬─────────┬────────┬────────────────────┐
//! │ Length   │ Version │ Status │ Payload            │
//! │ u16 LE   │ u8      │ u8     │ Length - 4 bytes   │
//! └──────────┴─────────┴────────┴────────────────────┘
//! ```
//!
//! `Length` counts the whole frame, header included.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{Error, Result};

pub const HEADER_LEN: usize = 4;

/// Tag-value reports.
pub const PROTO_V1: u8 = 1;
/// Binary batch reports.
pub const PROTO_V2: u8 = 2;
/// Binary batch reports with checksum feedback after the response.
pub const PROTO_V3: u8 = 3;

/// Version byte carried by every response frame, whatever the report version.
pub const RESPONSE_VERSION: u8 = PROTO_V1;

pub mod status {
    pub const OK: u8 = 0x00;
    pub const PROTOCOL_ERROR: u8 = 0x01;
    pub const RETRY_REPORT_ERROR: u8 = 0x02;

    /// Report status bit set while the device is on external power.
    pub const CHARGING: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub version: u8,
    pub status: u8,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::protocol(format!(
                "frame header needs {} bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        }
        let length = u16::from_le_bytes([buf[0], buf[1]]);
        if (length as usize) < HEADER_LEN {
            return Err(Error::protocol(format!(
                "frame length {} is shorter than its header",
                length
            )));
        }
        Ok(Self {
            length,
            version: buf[2],
            status: buf[3],
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    pub fn is_supported_report(&self) -> bool {
        (PROTO_V1..=PROTO_V3).contains(&self.version)
    }

    /// Whether the device echoes a checksum after receiving the response.
    pub fn wants_feedback(&self) -> bool {
        self.version > PROTO_V2
    }
}

pub fn encode_frame(version: u8, status: u8, payload: &[u8]) -> Result<Bytes> {
    let total = HEADER_LEN + payload.len();
    let length = u16::try_from(total).map_err(|_| {
        Error::protocol(format!(
            "frame length {} exceeded max value {}",
            total,
            u16::MAX
        ))
    })?;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(length);
    buf.put_u8(version);
    buf.put_u8(status);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split one complete frame into its header and payload.
pub fn split_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8])> {
    let header = FrameHeader::decode(buf)?;
    if buf.len() != header.length as usize {
        return Err(Error::protocol(format!(
            "frame declares {} bytes but {} were supplied",
            header.length,
            buf.len()
        )));
    }
    Ok((header, &buf[HEADER_LEN..]))
}

/// Checksum a device echoes back to confirm it applied a response.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}
