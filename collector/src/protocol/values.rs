//! Tag-value items carried in version 1 reports and in every response.
//!
//! Each tag byte maps to a fixed value width. Decoding looks the width up
//! before touching the value, so an unknown tag or a truncated value is
//! rejected without reading past the payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::{Error, Result};

/// Byte sent in place of the firmware URL in update directives.
pub const FW_URL_PLACEHOLDER: u8 = 1;

/// A value type that travels as `tag:u8` followed by a fixed-width value.
pub trait TaggedValue: Sized {
    type Tag: Copy + TryFrom<u8, Error = Error>;

    fn value_len(tag: Self::Tag) -> usize;

    /// Read the value for `tag`; the caller guarantees `value_len(tag)` bytes remain.
    fn read(tag: Self::Tag, buf: &mut &[u8]) -> Self;

    fn write(&self, buf: &mut BytesMut);
}

pub fn decode_values<V: TaggedValue>(mut buf: &[u8]) -> Result<Vec<V>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        let raw = buf.get_u8();
        let tag = V::Tag::try_from(raw)?;
        let needed = V::value_len(tag);
        if buf.remaining() < needed {
            return Err(Error::protocol(format!(
                "invalid value for tag {}: need {} bytes, {} left",
                raw,
                needed,
                buf.remaining()
            )));
        }
        values.push(V::read(tag, &mut buf));
    }
    Ok(values)
}

pub fn encode_values<V: TaggedValue>(values: &[V], buf: &mut BytesMut) {
    for value in values {
        value.write(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportTag {
    TemperatureOne = 1,
    Photometric = 2,
    RelativeHumidity = 3,
    TemperatureTwo = 4,
    Accelerometer = 5,
    BatteryVoltage = 6,
}

impl TryFrom<u8> for ReportTag {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => ReportTag::TemperatureOne,
            2 => ReportTag::Photometric,
            3 => ReportTag::RelativeHumidity,
            4 => ReportTag::TemperatureTwo,
            5 => ReportTag::Accelerometer,
            6 => ReportTag::BatteryVoltage,
            _ => return Err(Error::protocol(format!("invalid report tag {}", raw))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportValue {
    /// Tenths of a degree Celsius.
    TemperatureOne(i16),
    /// Percent.
    Photometric(u8),
    /// Percent.
    RelativeHumidity(u8),
    /// Tenths of a degree Celsius; takes precedence over `TemperatureOne`.
    TemperatureTwo(i16),
    Accelerometer(u8),
    /// Hundredths of a volt.
    BatteryVoltage(u16),
}

impl ReportValue {
    pub fn tag(&self) -> ReportTag {
        match self {
            ReportValue::TemperatureOne(_) => ReportTag::TemperatureOne,
            ReportValue::Photometric(_) => ReportTag::Photometric,
            ReportValue::RelativeHumidity(_) => ReportTag::RelativeHumidity,
            ReportValue::TemperatureTwo(_) => ReportTag::TemperatureTwo,
            ReportValue::Accelerometer(_) => ReportTag::Accelerometer,
            ReportValue::BatteryVoltage(_) => ReportTag::BatteryVoltage,
        }
    }
}

impl TaggedValue for ReportValue {
    type Tag = ReportTag;

    fn value_len(tag: ReportTag) -> usize {
        match tag {
            ReportTag::TemperatureOne | ReportTag::TemperatureTwo | ReportTag::BatteryVoltage => 2,
            ReportTag::Photometric | ReportTag::RelativeHumidity | ReportTag::Accelerometer => 1,
        }
    }

    fn read(tag: ReportTag, buf: &mut &[u8]) -> Self {
        match tag {
            ReportTag::TemperatureOne => ReportValue::TemperatureOne(buf.get_i16_le()),
            ReportTag::Photometric => ReportValue::Photometric(buf.get_u8()),
            ReportTag::RelativeHumidity => ReportValue::RelativeHumidity(buf.get_u8()),
            ReportTag::TemperatureTwo => ReportValue::TemperatureTwo(buf.get_i16_le()),
            ReportTag::Accelerometer => ReportValue::Accelerometer(buf.get_u8()),
            ReportTag::BatteryVoltage => ReportValue::BatteryVoltage(buf.get_u16_le()),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match *self {
            ReportValue::TemperatureOne(v) | ReportValue::TemperatureTwo(v) => buf.put_i16_le(v),
            ReportValue::Photometric(v)
            | ReportValue::RelativeHumidity(v)
            | ReportValue::Accelerometer(v) => buf.put_u8(v),
            ReportValue::BatteryVoltage(v) => buf.put_u16_le(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseTag {
    ReportFormat = 1,
    ReportInterval = 2,
    ReportBufferCapacity = 3,
    TemperatureThreshold = 4,
    AccelerometerThreshold = 5,
    LightThreshold = 6,
    HumidityThreshold = 7,
    LedColour = 8,
    DeviceCapabilities = 9,
    UpdateBootFw = 252,
    UpdateAppFw = 254,
}

impl TryFrom<u8> for ResponseTag {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => ResponseTag::ReportFormat,
            2 => ResponseTag::ReportInterval,
            3 => ResponseTag::ReportBufferCapacity,
            4 => ResponseTag::TemperatureThreshold,
            5 => ResponseTag::AccelerometerThreshold,
            6 => ResponseTag::LightThreshold,
            7 => ResponseTag::HumidityThreshold,
            8 => ResponseTag::LedColour,
            9 => ResponseTag::DeviceCapabilities,
            252 => ResponseTag::UpdateBootFw,
            254 => ResponseTag::UpdateAppFw,
            _ => return Err(Error::protocol(format!("invalid response tag {}", raw))),
        })
    }
}

/// Configuration and directives pushed to a device.
///
/// The update directives never carry the firmware location on the wire:
/// a single [`FW_URL_PLACEHOLDER`] byte follows the tag and the device
/// fetches the image from the download server on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseValue {
    ReportFormat(u8),
    /// Seconds between reports.
    ReportInterval(u16),
    ReportBufferCapacity(u16),
    /// Tenths of a degree Celsius.
    TemperatureThreshold { low: i16, high: i16 },
    AccelerometerThreshold { x: u16, y: u16, z: u16 },
    LightThreshold { low: u8, high: u8 },
    HumidityThreshold { low: u8, high: u8 },
    LedColour { r: u8, g: u8, b: u8 },
    DeviceCapabilities { low: u8, high: u8 },
    UpdateBootFw,
    UpdateAppFw,
}

impl ResponseValue {
    pub fn tag(&self) -> ResponseTag {
        match self {
            ResponseValue::ReportFormat(_) => ResponseTag::ReportFormat,
            ResponseValue::ReportInterval(_) => ResponseTag::ReportInterval,
            ResponseValue::ReportBufferCapacity(_) => ResponseTag::ReportBufferCapacity,
            ResponseValue::TemperatureThreshold { .. } => ResponseTag::TemperatureThreshold,
            ResponseValue::AccelerometerThreshold { .. } => ResponseTag::AccelerometerThreshold,
            ResponseValue::LightThreshold { .. } => ResponseTag::LightThreshold,
            ResponseValue::HumidityThreshold { .. } => ResponseTag::HumidityThreshold,
            ResponseValue::LedColour { .. } => ResponseTag::LedColour,
            ResponseValue::DeviceCapabilities { .. } => ResponseTag::DeviceCapabilities,
            ResponseValue::UpdateBootFw => ResponseTag::UpdateBootFw,
            ResponseValue::UpdateAppFw => ResponseTag::UpdateAppFw,
        }
    }

    pub fn is_firmware_update(&self) -> bool {
        matches!(self, ResponseValue::UpdateBootFw | ResponseValue::UpdateAppFw)
    }
}

impl TaggedValue for ResponseValue {
    type Tag = ResponseTag;

    fn value_len(tag: ResponseTag) -> usize {
        match tag {
            ResponseTag::ReportFormat => 1,
            ResponseTag::ReportInterval | ResponseTag::ReportBufferCapacity => 2,
            ResponseTag::TemperatureThreshold => 4,
            ResponseTag::AccelerometerThreshold => 6,
            ResponseTag::LightThreshold
            | ResponseTag::HumidityThreshold
            | ResponseTag::DeviceCapabilities => 2,
            ResponseTag::LedColour => 3,
            ResponseTag::UpdateBootFw | ResponseTag::UpdateAppFw => 1,
        }
    }

    fn read(tag: ResponseTag, buf: &mut &[u8]) -> Self {
        match tag {
            ResponseTag::ReportFormat => ResponseValue::ReportFormat(buf.get_u8()),
            ResponseTag::ReportInterval => ResponseValue::ReportInterval(buf.get_u16_le()),
            ResponseTag::ReportBufferCapacity => {
                ResponseValue::ReportBufferCapacity(buf.get_u16_le())
            }
            ResponseTag::TemperatureThreshold => ResponseValue::TemperatureThreshold {
                low: buf.get_i16_le(),
                high: buf.get_i16_le(),
            },
            ResponseTag::AccelerometerThreshold => ResponseValue::AccelerometerThreshold {
                x: buf.get_u16_le(),
                y: buf.get_u16_le(),
                z: buf.get_u16_le(),
            },
            ResponseTag::LightThreshold => ResponseValue::LightThreshold {
                low: buf.get_u8(),
                high: buf.get_u8(),
            },
            ResponseTag::HumidityThreshold => ResponseValue::HumidityThreshold {
                low: buf.get_u8(),
                high: buf.get_u8(),
            },
            ResponseTag::LedColour => ResponseValue::LedColour {
                r: buf.get_u8(),
                g: buf.get_u8(),
                b: buf.get_u8(),
            },
            ResponseTag::DeviceCapabilities => ResponseValue::DeviceCapabilities {
                low: buf.get_u8(),
                high: buf.get_u8(),
            },
            ResponseTag::UpdateBootFw => {
                buf.advance(1);
                ResponseValue::UpdateBootFw
            }
            ResponseTag::UpdateAppFw => {
                buf.advance(1);
                ResponseValue::UpdateAppFw
            }
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match *self {
            ResponseValue::ReportFormat(v) => buf.put_u8(v),
            ResponseValue::ReportInterval(v) | ResponseValue::ReportBufferCapacity(v) => {
                buf.put_u16_le(v)
            }
            ResponseValue::TemperatureThreshold { low, high } => {
                buf.put_i16_le(low);
                buf.put_i16_le(high);
            }
            ResponseValue::AccelerometerThreshold { x, y, z } => {
                buf.put_u16_le(x);
                buf.put_u16_le(y);
                buf.put_u16_le(z);
            }
            ResponseValue::LightThreshold { low, high }
            | ResponseValue::HumidityThreshold { low, high }
            | ResponseValue::DeviceCapabilities { low, high } => {
                buf.put_u8(low);
                buf.put_u8(high);
            }
            ResponseValue::LedColour { r, g, b } => {
                buf.put_u8(r);
                buf.put_u8(g);
                buf.put_u8(b);
            }
            ResponseValue::UpdateBootFw | ResponseValue::UpdateAppFw => {
                buf.put_u8(FW_URL_PLACEHOLDER)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<V: TaggedValue>(values: &[V]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_values(values, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_report_values_roundtrip() {
        let values = vec![
            ReportValue::TemperatureOne(421),
            ReportValue::Photometric(30),
            ReportValue::RelativeHumidity(14),
            ReportValue::TemperatureTwo(-52),
            ReportValue::Accelerometer(1),
            ReportValue::BatteryVoltage(330),
        ];
        let bytes = encode(&values);
        assert_eq!(decode_values::<ReportValue>(&bytes).unwrap(), values);
    }

    #[test]
    fn test_response_values_roundtrip() {
        let values = vec![
            ResponseValue::ReportFormat(2),
            ResponseValue::ReportInterval(300),
            ResponseValue::ReportBufferCapacity(64),
            ResponseValue::TemperatureThreshold { low: -100, high: 350 },
            ResponseValue::AccelerometerThreshold { x: 0x10, y: 0x20, z: 0xffff },
            ResponseValue::LightThreshold { low: 5, high: 20 },
            ResponseValue::HumidityThreshold { low: 10, high: 80 },
            ResponseValue::LedColour { r: 0x4c, g: 0x96, b: 0xfc },
            ResponseValue::DeviceCapabilities { low: 3, high: 0 },
            ResponseValue::UpdateBootFw,
            ResponseValue::UpdateAppFw,
        ];
        let bytes = encode(&values);
        assert_eq!(decode_values::<ResponseValue>(&bytes).unwrap(), values);
    }

    #[test]
    fn test_empty_value_lists() {
        assert!(encode::<ReportValue>(&[]).is_empty());
        assert!(decode_values::<ReportValue>(&[]).unwrap().is_empty());
        assert!(decode_values::<ResponseValue>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(encode(&[ReportValue::TemperatureOne(421)]), vec![1, 0xa5, 0x01]);
        assert_eq!(
            encode(&[ResponseValue::TemperatureThreshold { low: 100, high: -1 }]),
            vec![4, 100, 0, 0xff, 0xff]
        );
    }

    #[test]
    fn test_update_directives_send_placeholder_only() {
        assert_eq!(encode(&[ResponseValue::UpdateBootFw]), vec![252, FW_URL_PLACEHOLDER]);
        assert_eq!(encode(&[ResponseValue::UpdateAppFw]), vec![254, FW_URL_PLACEHOLDER]);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = decode_values::<ReportValue>(&[7, 1]).unwrap_err();
        assert!(err.to_string().contains("invalid report tag 7"));
        assert!(decode_values::<ResponseValue>(&[253, 1]).is_err());
    }

    #[test]
    fn test_truncated_value_rejected() {
        assert!(decode_values::<ReportValue>(&[1, 0x10]).is_err());
        assert!(decode_values::<ReportValue>(&[2, 10, 6, 1]).is_err());
        assert!(decode_values::<ResponseValue>(&[5, 1, 0, 2, 0, 3]).is_err());
        assert!(decode_values::<ResponseValue>(&[252]).is_err());
    }
}
