use std::sync::Arc;

use tracing::debug;

use crate::errors::Result;
use crate::model::{LimitType, PendingLimit};
use crate::protocol::ResponseValue;
use crate::store::Store;

const DEFAULT_MOVEMENT: &str = "0000,0000,0000";
const DEFAULT_COLOUR: &str = "4C96FC";

/// Response values built from a device's queued limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedLimits {
    pub values: Vec<ResponseValue>,
    /// The pending rows as read, so a confirmed commit deletes only what was sent.
    pub consumed: Vec<PendingLimit>,
}

/// Turns pending configuration changes into response values.
#[derive(Clone)]
pub struct LimitResolver {
    store: Arc<dyn Store>,
}

impl LimitResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Load every pending limit of a device and map it to response values.
    ///
    /// With `remove` set the rows are deleted in the same transaction;
    /// otherwise the caller commits the deletion once the device confirms.
    pub async fn resolve(&self, device_id: &str, remove: bool) -> Result<ResolvedLimits> {
        let pending = self.store.take_pending_limits(device_id, remove).await?;
        let flags = self
            .store
            .device(device_id)
            .await?
            .map_or(0, |device| device.flags);

        let resolved = build_values(&pending, flags);
        debug!(
            "Resolved {} pending limits into {} values for {}",
            pending.len(),
            resolved.values.len(),
            device_id
        );
        Ok(resolved)
    }

    /// Delete the rows a confirmed response delivered.
    pub async fn commit(&self, device_id: &str, consumed: &[PendingLimit]) -> Result<()> {
        self.store.delete_pending_limits(device_id, consumed).await
    }
}

/// Single pass over the pending rows in order. Device capabilities are
/// always appended, the temperature window only when both bounds are queued.
pub fn build_values(pending: &[PendingLimit], device_flags: i32) -> ResolvedLimits {
    let mut values = Vec::with_capacity(pending.len() + 2);
    let mut temp_low = None;
    let mut temp_high = None;
    let mut sample_rate = 0u8;

    for limit in pending {
        let Some(kind) = limit.kind() else {
            continue;
        };
        match kind {
            LimitType::TempLow => temp_low = Some(limit.limit_value),
            LimitType::TempHigh => temp_high = Some(limit.limit_value),
            LimitType::HumidityLevel => {
                let (low, high) = percentage_pair(limit.limit_value);
                values.push(ResponseValue::HumidityThreshold { low, high });
            }
            LimitType::LightLevel => {
                let (low, high) = percentage_pair(limit.limit_value);
                values.push(ResponseValue::LightThreshold { low, high });
            }
            LimitType::MovementLevel => {
                let text = limit.limit_value_string.as_deref().unwrap_or(DEFAULT_MOVEMENT);
                values.push(parse_movement(text));
            }
            LimitType::Colour => {
                let text = limit.limit_value_string.as_deref().unwrap_or(DEFAULT_COLOUR);
                if let Some(colour) = parse_colour(text) {
                    values.push(colour);
                }
            }
            LimitType::Interval => {
                values.push(ResponseValue::ReportInterval(limit.limit_value as u16));
            }
            LimitType::ReportFormat => {
                values.push(ResponseValue::ReportFormat(limit.limit_value as u8));
            }
            LimitType::ReportBufferCapacity => sample_rate = limit.limit_value as u8,
            LimitType::BatteryLevel | LimitType::Notifications | LimitType::TempScale => {}
        }
    }

    values.push(ResponseValue::DeviceCapabilities {
        low: (device_flags & 0xFF) as u8,
        high: sample_rate,
    });

    if let (Some(low), Some(high)) = (temp_low, temp_high) {
        values.push(ResponseValue::TemperatureThreshold {
            low: (low * 10.0) as i16,
            high: (high * 10.0) as i16,
        });
    }

    ResolvedLimits {
        values,
        consumed: pending.to_vec(),
    }
}

/// Unpack a stored percentage window: upper bound in bits 8–15, lower
/// bound in bits 0–7. Each side is clamped to 100 and the pair is ordered.
pub fn percentage_pair(value: f32) -> (u8, u8) {
    let packed = value as u16;
    let upper = ((packed >> 8) as u8).min(100);
    let lower = ((packed & 0xFF) as u8).min(100);
    if lower > upper {
        (upper, lower)
    } else {
        (lower, upper)
    }
}

/// `"xxxx,yyyy,zzzz"` in hex; missing or malformed axes become 0.
fn parse_movement(text: &str) -> ResponseValue {
    let mut axes = text
        .split(',')
        .map(|part| u16::from_str_radix(part.trim(), 16).unwrap_or(0));
    ResponseValue::AccelerometerThreshold {
        x: axes.next().unwrap_or(0),
        y: axes.next().unwrap_or(0),
        z: axes.next().unwrap_or(0),
    }
}

fn parse_colour(text: &str) -> Option<ResponseValue> {
    let rgb = u32::from_str_radix(text.trim().trim_start_matches('#'), 16).ok()?;
    Some(ResponseValue::LedColour {
        r: (rgb >> 16) as u8,
        g: (rgb >> 8) as u8,
        b: rgb as u8,
    })
}
