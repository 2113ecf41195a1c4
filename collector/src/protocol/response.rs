use bytes::{Bytes, BytesMut};

use super::frame::{encode_frame, split_frame, status, RESPONSE_VERSION};
use super::values::{decode_values, encode_values, ResponseValue};
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub status: u8,
    pub values: Vec<ResponseValue>,
}

impl Response {
    pub fn ok(values: Vec<ResponseValue>) -> Self {
        Self {
            version: RESPONSE_VERSION,
            status: status::OK,
            values,
        }
    }

    /// Error reply: status only, empty payload.
    pub fn error(code: u8) -> Self {
        Self {
            version: RESPONSE_VERSION,
            status: code,
            values: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        encode_values(&self.values, &mut payload);
        encode_frame(self.version, self.status, &payload)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, payload) = split_frame(frame)?;
        Ok(Self {
            version: header.version,
            status: header.status,
            values: decode_values(payload)?,
        })
    }
}
