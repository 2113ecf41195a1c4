use std::cmp::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::errors::Result;
use crate::model::{FirmwareType, Observation};
use crate::protocol::ResponseValue;
use crate::store::Store;

/// Resolves firmware upgrades along the "obsoleted by" chain.
#[derive(Clone)]
pub struct FirmwareResolver {
    store: Arc<dyn Store>,
}

impl FirmwareResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Newest firmware of a type that nothing obsoletes.
    pub async fn latest(&self, kind: FirmwareType) -> Result<Option<String>> {
        let current = self.store.current_firmware(kind).await?;
        Ok(current
            .into_iter()
            .map(|r| r.version)
            .max_by(|a, b| compare_versions(a, b)))
    }

    /// Version that replaces `from`. A version missing from the registry
    /// cannot be upgraded.
    pub async fn next_version(&self, kind: FirmwareType, from: &str) -> Result<Option<String>> {
        let Some(record) = self.store.firmware(from, kind).await? else {
            return Ok(None);
        };
        Ok(record
            .obsoleted_by
            .map(|v| v.trim_matches(|c| matches!(c, '\t' | '\r' | '\n' | ' ')).to_string())
            .filter(|v| !v.is_empty()))
    }

    /// At most one update directive, boot firmware first.
    pub async fn directive(&self, obs: &Observation) -> Result<Option<ResponseValue>> {
        if let Some(next) = self.next_version(FirmwareType::Boot, &obs.firmware).await? {
            info!(
                "Sending want boot firmware update to {}@{}->{}",
                obs.device_id, obs.firmware, next
            );
            return Ok(Some(ResponseValue::UpdateBootFw));
        }
        if let Some(wifi) = &obs.wifi_firmware {
            if let Some(next) = self.next_version(FirmwareType::Wifi, wifi).await? {
                info!(
                    "Sending want wifi firmware update to {}@{}->{}",
                    obs.device_id, wifi, next
                );
                return Ok(Some(ResponseValue::UpdateAppFw));
            }
        }
        info!(
            "No firmware for {}@wifi:{}/boot:{}",
            obs.device_id,
            obs.wifi_firmware.as_deref().unwrap_or(""),
            obs.firmware
        );
        Ok(None)
    }
}

/// Order dotted firmware versions segment by segment, numerically where
/// both segments are numbers (`1.0.10` > `1.0.9`). Versions that compare
/// equal segment-wise fall back to plain string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
