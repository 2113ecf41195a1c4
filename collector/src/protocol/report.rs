//! Report payload decoding for every supported protocol version.
//!
//! Version 1 carries one reading as tag-value pairs after a
//! `deviceId,bootFW,wifiFW\0` preamble. Versions 2 and 3 carry a batch of
//! fixed-size binary records:
//!
//! ```text
//! header  { clock:i32, count:i16, reserved:i16 }                        8 bytes
//! record  { offset:i32, battery:i16, temp:i16, rh_temp:i16,
//!           humidity:i8, light:i8, x:i32, y:i32, z:i32 }    count × 24 bytes
//! trailer "deviceId,bootFW,wifiFW\0"
//! ```
//!
//! All integers are little-endian. Record clocks are device seconds; the
//! header clock is the device's "now", so the server rebases each record
//! onto its own wall clock.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::frame::{encode_frame, status, FrameHeader, PROTO_V1, PROTO_V2, PROTO_V3};
use super::values::{decode_values, encode_values, ReportValue};
use crate::errors::{Error, Result};
use crate::model::Observation;

pub const BATCH_HEADER_LEN: usize = 8;
pub const BATCH_RECORD_LEN: usize = 24;

const COMMA: u8 = b',';
const NUL: u8 = 0;

/// An observation decoded from a report, flagged when it drives the
/// response and alert cycle for its frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub observation: Observation,
    pub delegate: bool,
}

/// Decode a report payload into observations in arrival order.
///
/// Exactly one record comes back with `delegate` set: the last one.
pub fn decode_report(
    header: &FrameHeader,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<DecodedRecord>> {
    match header.version {
        PROTO_V1 => {
            let report = TaggedReport::decode(header.status, payload)?;
            Ok(vec![DecodedRecord {
                observation: report.to_observation(now),
                delegate: true,
            }])
        }
        PROTO_V2 | PROTO_V3 => Ok(BatchReport::decode(payload)?.to_records(now)),
        other => Err(Error::protocol(format!(
            "unhandled protocol version {}",
            other
        ))),
    }
}

/// Version 1 report.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedReport {
    pub status: u8,
    pub device_id: String,
    pub boot_fw: String,
    pub wifi_fw: String,
    pub values: Vec<ReportValue>,
}

impl TaggedReport {
    pub fn decode(status: u8, payload: &[u8]) -> Result<Self> {
        let (device_id, rest) = take_field(payload, COMMA)?;
        let (boot_fw, rest) = take_field(rest, COMMA)?;
        let (wifi_fw, rest) = take_field(rest, NUL)?;
        let values = decode_values(rest)?;
        Ok(Self {
            status,
            device_id,
            boot_fw,
            wifi_fw,
            values,
        })
    }

    /// Encode as a complete version 1 frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        put_identity(&mut payload, &self.device_id, &self.boot_fw, &self.wifi_fw);
        encode_values(&self.values, &mut payload);
        encode_frame(PROTO_V1, self.status, &payload)
    }

    pub fn to_observation(&self, now: DateTime<Utc>) -> Observation {
        let mut obs = Observation::null(
            self.device_id.clone(),
            self.boot_fw.clone(),
            optional(&self.wifi_fw),
        );
        obs.timestamp = now.timestamp_millis();
        obs.charging = self.status & status::CHARGING != 0;
        for value in &self.values {
            match *value {
                ReportValue::TemperatureOne(t) => {
                    if obs.temperature == 0.0 {
                        obs.temperature = f64::from(t) / 10.0;
                    }
                }
                ReportValue::Photometric(v) => obs.light = i32::from(v),
                ReportValue::RelativeHumidity(v) => obs.humidity = i32::from(v),
                ReportValue::TemperatureTwo(t) => obs.temperature = f64::from(t) / 10.0,
                ReportValue::Accelerometer(v) => {
                    let v = i32::from(v);
                    obs.accel_x = v;
                    obs.accel_y = v;
                    obs.accel_z = v;
                }
                ReportValue::BatteryVoltage(v) => obs.battery = f64::from(v) / 100.0,
            }
        }
        obs
    }
}

/// One fixed-size record of a batch report, as sent by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRecord {
    /// Device clock when the reading was taken, in seconds.
    pub clock_offset: i32,
    /// Hundredths of a volt; negative while charging.
    pub battery: i16,
    /// Tenths of a degree Celsius.
    pub temperature: i16,
    /// Humidity sensor temperature, tenths of a degree Celsius.
    pub rh_temperature: i16,
    pub humidity: i8,
    pub light: i8,
    pub accel_x: i32,
    pub accel_y: i32,
    pub accel_z: i32,
}

impl BatchRecord {
    fn read(buf: &mut &[u8]) -> Self {
        Self {
            clock_offset: buf.get_i32_le(),
            battery: buf.get_i16_le(),
            temperature: buf.get_i16_le(),
            rh_temperature: buf.get_i16_le(),
            humidity: buf.get_i8(),
            light: buf.get_i8(),
            accel_x: buf.get_i32_le(),
            accel_y: buf.get_i32_le(),
            accel_z: buf.get_i32_le(),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.clock_offset);
        buf.put_i16_le(self.battery);
        buf.put_i16_le(self.temperature);
        buf.put_i16_le(self.rh_temperature);
        buf.put_i8(self.humidity);
        buf.put_i8(self.light);
        buf.put_i32_le(self.accel_x);
        buf.put_i32_le(self.accel_y);
        buf.put_i32_le(self.accel_z);
    }
}

/// Version 2/3 report.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// Device clock at send time, in seconds.
    pub clock: i32,
    pub reserved: i16,
    pub records: Vec<BatchRecord>,
    pub device_id: String,
    pub boot_fw: String,
    pub wifi_fw: String,
}

impl BatchReport {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < BATCH_HEADER_LEN {
            return Err(Error::protocol(format!(
                "batch header needs {} bytes, got {}",
                BATCH_HEADER_LEN,
                payload.len()
            )));
        }
        let mut buf = payload;
        let clock = buf.get_i32_le();
        let count = buf.get_i16_le();
        let reserved = buf.get_i16_le();

        let count = usize::try_from(count)
            .map_err(|_| Error::protocol(format!("negative record count {}", count)))?;
        // The identity trailer needs at least its terminator.
        if count * BATCH_RECORD_LEN >= buf.remaining() {
            return Err(Error::protocol(format!(
                "{} records do not fit in {} payload bytes",
                count,
                payload.len()
            )));
        }

        let records = (0..count).map(|_| BatchRecord::read(&mut buf)).collect();

        let (identity, _) = take_field(buf, NUL)?;
        let fields: Vec<&str> = identity.split(',').collect();
        let [device_id, boot_fw, wifi_fw] = fields.as_slice() else {
            return Err(Error::protocol(format!(
                "expected 3 identity fields, got {:?}",
                identity
            )));
        };

        Ok(Self {
            clock,
            reserved,
            records,
            device_id: device_id.to_string(),
            boot_fw: boot_fw.to_string(),
            wifi_fw: wifi_fw.to_string(),
        })
    }

    /// Encode as a complete frame of the given batch version (2 or 3).
    pub fn encode(&self, version: u8) -> Result<Bytes> {
        let count = i16::try_from(self.records.len()).map_err(|_| {
            Error::protocol(format!("too many records: {}", self.records.len()))
        })?;
        let mut payload = BytesMut::with_capacity(
            BATCH_HEADER_LEN + self.records.len() * BATCH_RECORD_LEN + 32,
        );
        payload.put_i32_le(self.clock);
        payload.put_i16_le(count);
        payload.put_i16_le(self.reserved);
        for record in &self.records {
            record.write(&mut payload);
        }
        put_identity(&mut payload, &self.device_id, &self.boot_fw, &self.wifi_fw);
        encode_frame(version, status::OK, &payload)
    }

    /// Rebase records onto server time. An empty batch yields a single null
    /// record so the device can still receive configuration.
    pub fn to_records(&self, now: DateTime<Utc>) -> Vec<DecodedRecord> {
        let wifi_fw = optional(&self.wifi_fw);
        if self.records.is_empty() {
            return vec![DecodedRecord {
                observation: Observation::null(
                    self.device_id.clone(),
                    self.boot_fw.clone(),
                    wifi_fw,
                ),
                delegate: true,
            }];
        }

        let skew = now.timestamp() - i64::from(self.clock);
        let last = self.records.len() - 1;
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| DecodedRecord {
                observation: Observation {
                    device_id: self.device_id.clone(),
                    timestamp: (skew + i64::from(r.clock_offset)) * 1000,
                    charging: r.battery < 0,
                    firmware: self.boot_fw.clone(),
                    wifi_firmware: wifi_fw.clone(),
                    battery: f64::from(i32::from(r.battery).abs()) / 100.0,
                    temperature: f64::from(r.temperature) / 10.0,
                    light: i32::from(r.light),
                    humidity: i32::from(r.humidity),
                    accel_x: r.accel_x,
                    accel_y: r.accel_y,
                    accel_z: r.accel_z,
                },
                delegate: i == last,
            })
            .collect()
    }
}

fn take_field(buf: &[u8], delimiter: u8) -> Result<(String, &[u8])> {
    let end = buf
        .iter()
        .position(|b| *b == delimiter)
        .ok_or_else(|| Error::protocol("unable to read report id and version info"))?;
    let field = std::str::from_utf8(&buf[..end])
        .map_err(|e| Error::protocol(format!("report id is not UTF-8: {}", e)))?;
    Ok((field.to_string(), &buf[end + 1..]))
}

fn put_identity(buf: &mut BytesMut, device_id: &str, boot_fw: &str, wifi_fw: &str) {
    buf.put_slice(device_id.as_bytes());
    buf.put_u8(COMMA);
    buf.put_slice(boot_fw.as_bytes());
    buf.put_u8(COMMA);
    buf.put_slice(wifi_fw.as_bytes());
    buf.put_u8(NUL);
}

fn optional(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
