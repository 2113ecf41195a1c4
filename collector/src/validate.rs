use crate::errors::{Error, Result};
use crate::model::Observation;

const DEVICE_ID_MAX: usize = 64;

/// Validates a decoded observation before it reaches storage.
pub fn validate(obs: &Observation) -> Result<()> {
    // Validate device_id
    if obs.device_id.is_empty() {
        return Err(Error::protocol("Device ID cannot be empty"));
    }
    if obs.device_id.len() > DEVICE_ID_MAX {
        return Err(Error::protocol(format!(
            "Device ID longer than {} bytes",
            DEVICE_ID_MAX
        )));
    }
    if !obs.device_id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::protocol(format!(
            "Device ID {:?} contains non-printable characters",
            obs.device_id
        )));
    }

    // Validate firmware
    if obs.firmware.is_empty() {
        return Err(Error::protocol(format!(
            "Device {} reported no boot firmware version",
            obs.device_id
        )));
    }

    if !obs.battery.is_finite() || !obs.temperature.is_finite() {
        return Err(Error::protocol(format!(
            "Device {} reported non-finite readings",
            obs.device_id
        )));
    }

    Ok(())
}
