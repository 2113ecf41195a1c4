use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One sensor reading reported by a biq device.
///
/// A timestamp of zero marks a "null" record: it exists only so a device
/// without buffered readings can still pick up configuration, and it is
/// never stored as telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Observation {
    pub device_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub charging: bool,
    pub firmware: String,
    pub wifi_firmware: Option<String>,
    pub battery: f64,
    pub temperature: f64,
    pub light: i32,
    pub humidity: i32,
    pub accel_x: i32,
    pub accel_y: i32,
    pub accel_z: i32,
}

impl Observation {
    pub fn null(device_id: String, firmware: String, wifi_firmware: Option<String>) -> Self {
        Self {
            device_id,
            timestamp: 0,
            charging: false,
            firmware,
            wifi_firmware,
            battery: 0.0,
            temperature: 0.0,
            light: 0,
            humidity: 0,
            accel_x: 0,
            accel_y: 0,
            accel_z: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.timestamp == 0
    }
}

/// Kinds of per-device limits, shared by queued pushes and alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    TempLow,
    TempHigh,
    MovementLevel,
    BatteryLevel,
    Notifications,
    TempScale,
    Colour,
    Interval,
    ReportFormat,
    ReportBufferCapacity,
    LightLevel,
    HumidityLevel,
}

impl LimitType {
    const ALL: [LimitType; 12] = [
        LimitType::TempLow,
        LimitType::TempHigh,
        LimitType::MovementLevel,
        LimitType::BatteryLevel,
        LimitType::Notifications,
        LimitType::TempScale,
        LimitType::Colour,
        LimitType::Interval,
        LimitType::ReportFormat,
        LimitType::ReportBufferCapacity,
        LimitType::LightLevel,
        LimitType::HumidityLevel,
    ];

    /// Value stored in the `limit_type` column.
    pub fn raw(self) -> i32 {
        match self {
            LimitType::TempLow => 0,
            LimitType::TempHigh => 1,
            LimitType::MovementLevel => 2,
            LimitType::BatteryLevel => 3,
            LimitType::Notifications => 4,
            LimitType::TempScale => 5,
            LimitType::Colour => 6,
            LimitType::Interval => 7,
            LimitType::ReportFormat => 8,
            LimitType::ReportBufferCapacity => 9,
            LimitType::LightLevel => 10,
            LimitType::HumidityLevel => 11,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.raw() == raw)
    }
}

/// A configuration change queued for delivery on the device's next contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingLimit {
    pub device_id: String,
    pub limit_type: i32,
    pub limit_value: f32,
    pub limit_value_string: Option<String>,
}

impl PendingLimit {
    pub fn new(device_id: &str, kind: LimitType, value: f32, text: Option<&str>) -> Self {
        Self {
            device_id: device_id.to_string(),
            limit_type: kind.raw(),
            limit_value: value,
            limit_value_string: text.map(str::to_string),
        }
    }

    pub fn kind(&self) -> Option<LimitType> {
        LimitType::from_raw(self.limit_type)
    }
}

/// Alert threshold or notification toggle owned by one user for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceLimit {
    pub device_id: String,
    pub user_id: Uuid,
    pub limit_type: i32,
    pub limit_value: f32,
    pub limit_value_string: Option<String>,
}

impl DeviceLimit {
    pub fn new(device_id: &str, user_id: Uuid, kind: LimitType, value: f32, text: Option<&str>) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id,
            limit_type: kind.raw(),
            limit_value: value,
            limit_value_string: text.map(str::to_string),
        }
    }

    pub fn kind(&self) -> Option<LimitType> {
        LimitType::from_raw(self.limit_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareType {
    /// Main microcontroller firmware (EFM).
    Boot,
    /// Companion wifi module firmware (ESP).
    Wifi,
}

impl FirmwareType {
    pub fn raw(self) -> i32 {
        match self {
            FirmwareType::Boot => 0,
            FirmwareType::Wifi => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FirmwareRecord {
    pub version: String,
    pub firmware_type: i32,
    pub obsoleted_by: Option<String>,
}

impl FirmwareRecord {
    pub fn new(version: &str, kind: FirmwareType, obsoleted_by: Option<&str>) -> Self {
        Self {
            version: version.to_string(),
            firmware_type: kind.raw(),
            obsoleted_by: obsoleted_by.map(str::to_string),
        }
    }
}

/// Device directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceEntry {
    pub id: String,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub flags: i32,
}

impl DeviceEntry {
    /// Name shown in notifications; unnamed devices use the id's last six characters.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        let skip = self.id.chars().count().saturating_sub(6);
        self.id.chars().skip(skip).collect()
    }
}

/// Filters for the observation read API
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ObservationQuery {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ObservationResponse {
    pub data: Vec<Observation>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}
