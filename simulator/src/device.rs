use biq_collector::protocol::{BatchRecord, BatchReport};
use chrono::Utc;
use rand::Rng;

/// Seconds between buffered readings on a simulated device.
const SAMPLE_SPACING_SECS: i32 = 30;

/// A simulated biq unit with its identity and firmware.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub id: String,
    pub boot_fw: String,
    pub wifi_fw: String,
    /// Device clock at power-on, seconds.
    boot_clock: i32,
    boot_time: i64,
}

impl SimDevice {
    pub fn new(index: usize, rng: &mut impl Rng) -> Self {
        Self {
            id: format!("UBIQSIM{:06X}", index),
            boot_fw: "1.0.0".to_string(),
            wifi_fw: "esp1".to_string(),
            boot_clock: rng.gen_range(0..10_000),
            boot_time: Utc::now().timestamp(),
        }
    }

    /// Device clock "now"; it ticks independently of the server clock.
    fn clock(&self) -> i32 {
        let uptime = (Utc::now().timestamp() - self.boot_time).clamp(0, i64::from(i32::MAX / 2));
        self.boot_clock + uptime as i32
    }

    /// A batch of `count` readings taken at fixed spacing up to now.
    pub fn report(&self, rng: &mut impl Rng, count: usize) -> BatchReport {
        let clock = self.clock();
        let records = (0..count)
            .map(|i| {
                let age = (count - 1 - i) as i32 * SAMPLE_SPACING_SECS;
                generate_record(rng, clock - age)
            })
            .collect();
        BatchReport {
            clock,
            reserved: 0,
            records,
            device_id: self.id.clone(),
            boot_fw: self.boot_fw.clone(),
            wifi_fw: self.wifi_fw.clone(),
        }
    }
}

fn generate_record(rng: &mut impl Rng, clock_offset: i32) -> BatchRecord {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-100..450) // 5% outliers
    } else {
        rng.gen_range(150..350) // Normal range
    };

    let mut battery = if rng.gen_bool(0.02) {
        rng.gen_range(280..320) // 2% low battery
    } else {
        rng.gen_range(320..420) // Normal range
    };
    if rng.gen_bool(0.1) {
        battery = -battery; // charging
    }

    // Low half of x counts movements; y/z carry activity.
    let (accel_x, accel_y, accel_z) = if rng.gen_bool(0.03) {
        (rng.gen_range(1..20), rng.gen_range(1..512), rng.gen_range(1..512))
    } else {
        (0, 0, 0)
    };

    BatchRecord {
        clock_offset,
        battery,
        temperature,
        rh_temperature: temperature,
        humidity: rng.gen_range(30..80),
        light: rng.gen_range(0..100),
        accel_x,
        accel_y,
        accel_z,
    }
}
