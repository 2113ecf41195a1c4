use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::errors::{Error, Result};
use crate::model::{
    DeviceEntry, DeviceLimit, FirmwareRecord, FirmwareType, LimitType, Observation,
    ObservationQuery, PendingLimit,
};

#[derive(Default)]
struct Tables {
    observations: Vec<Observation>,
    pending_limits: Vec<PendingLimit>,
    firmware: Vec<FirmwareRecord>,
    devices: HashMap<String, DeviceEntry>,
    device_limits: Vec<DeviceLimit>,
    recipients: HashMap<Uuid, Vec<String>>,
    chat_log: Vec<(String, String)>,
}

/// Volatile store; contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the database were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Storage("store is offline".to_string()));
        }
        Ok(())
    }

    /// Queue a limit, replacing any pending limit of the same type.
    pub async fn push_limit(&self, limit: PendingLimit) {
        let mut tables = self.tables.lock().await;
        tables
            .pending_limits
            .retain(|l| !(l.device_id == limit.device_id && l.limit_type == limit.limit_type));
        tables.pending_limits.push(limit);
    }

    pub async fn add_firmware(&self, record: FirmwareRecord) {
        self.tables.lock().await.firmware.push(record);
    }

    pub async fn add_device(&self, device: DeviceEntry) {
        self.tables
            .lock()
            .await
            .devices
            .insert(device.id.clone(), device);
    }

    pub async fn add_device_limit(&self, limit: DeviceLimit) {
        self.tables.lock().await.device_limits.push(limit);
    }

    pub async fn add_recipient(&self, user_id: Uuid, token: &str) {
        self.tables
            .lock()
            .await
            .recipients
            .entry(user_id)
            .or_default()
            .push(token.to_string());
    }

    pub async fn stored_observations(&self) -> Vec<Observation> {
        self.tables.lock().await.observations.clone()
    }

    pub async fn pending_limits(&self, device_id: &str) -> Vec<PendingLimit> {
        self.tables
            .lock()
            .await
            .pending_limits
            .iter()
            .filter(|l| l.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn chat_log(&self) -> Vec<(String, String)> {
        self.tables.lock().await.chat_log.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_observations(&self, batch: &[Observation]) -> Result<()> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .observations
            .extend_from_slice(batch);
        Ok(())
    }

    async fn take_pending_limits(&self, device_id: &str, remove: bool) -> Result<Vec<PendingLimit>> {
        self.check_online()?;
        let mut tables = self.tables.lock().await;
        let limits: Vec<PendingLimit> = tables
            .pending_limits
            .iter()
            .filter(|l| l.device_id == device_id)
            .cloned()
            .collect();
        if remove {
            tables.pending_limits.retain(|l| l.device_id != device_id);
        }
        Ok(limits)
    }

    async fn delete_pending_limits(&self, device_id: &str, delivered: &[PendingLimit]) -> Result<()> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .pending_limits
            .retain(|l| l.device_id != device_id || !delivered.contains(l));
        Ok(())
    }

    async fn firmware(&self, version: &str, kind: FirmwareType) -> Result<Option<FirmwareRecord>> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .firmware
            .iter()
            .find(|f| f.version == version && f.firmware_type == kind.raw())
            .cloned())
    }

    async fn current_firmware(&self, kind: FirmwareType) -> Result<Vec<FirmwareRecord>> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .firmware
            .iter()
            .filter(|f| f.obsoleted_by.is_none() && f.firmware_type == kind.raw())
            .cloned()
            .collect())
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>> {
        self.check_online()?;
        Ok(self.tables.lock().await.devices.get(device_id).cloned())
    }

    async fn device_limits(&self, device_id: &str, user_id: Uuid) -> Result<Vec<DeviceLimit>> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .device_limits
            .iter()
            .filter(|l| l.device_id == device_id && l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn notification_limits(&self, device_id: &str) -> Result<Vec<DeviceLimit>> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .device_limits
            .iter()
            .filter(|l| {
                l.device_id == device_id
                    && l.kind() == Some(LimitType::Notifications)
                    && l.limit_value != 0.0
            })
            .cloned()
            .collect())
    }

    async fn recipient_tokens(&self, user_id: Uuid) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .recipients
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_chat_log(&self, device_id: &str, content: &str) -> Result<()> {
        self.check_online()?;
        self.tables
            .lock()
            .await
            .chat_log
            .push((device_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>> {
        self.check_online()?;
        let limit = query.limit.unwrap_or(100).min(1000);
        let offset = query.offset.unwrap_or(0);

        let mut matching: Vec<Observation> = self
            .tables
            .lock()
            .await
            .observations
            .iter()
            .filter(|o| matches_query(o, query))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_observations(&self, query: &ObservationQuery) -> Result<u64> {
        self.check_online()?;
        let tables = self.tables.lock().await;
        Ok(tables.observations.iter().filter(|o| matches_query(o, query)).count() as u64)
    }
}

fn matches_query(obs: &Observation, query: &ObservationQuery) -> bool {
    query.device_id.as_ref().map_or(true, |id| &obs.device_id == id)
        && query.start.map_or(true, |s| obs.timestamp >= s.timestamp_millis())
        && query.end.map_or(true, |e| obs.timestamp <= e.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(device_id: &str, timestamp: i64) -> Observation {
        let mut o = Observation::null(device_id.to_string(), "1.0.0".to_string(), None);
        o.timestamp = timestamp;
        o
    }

    #[tokio::test]
    async fn test_take_pending_limits_removes_when_asked() {
        let store = MemoryStore::new();
        store
            .push_limit(PendingLimit::new("dev-1", LimitType::Interval, 300.0, None))
            .await;
        store
            .push_limit(PendingLimit::new("dev-2", LimitType::Interval, 60.0, None))
            .await;

        let kept = store.take_pending_limits("dev-1", false).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(store.pending_limits("dev-1").await.len(), 1);

        let taken = store.take_pending_limits("dev-1", true).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert!(store.pending_limits("dev-1").await.is_empty());
        assert_eq!(store.pending_limits("dev-2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_push_limit_replaces_same_type() {
        let store = MemoryStore::new();
        store
            .push_limit(PendingLimit::new("dev-1", LimitType::Interval, 300.0, None))
            .await;
        store
            .push_limit(PendingLimit::new("dev-1", LimitType::Interval, 600.0, None))
            .await;
        let limits = store.pending_limits("dev-1").await;
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].limit_value, 600.0);
    }

    #[test]
    fn test_offline_store_fails() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.set_offline(true);
            let err = store.insert_observations(&[obs("dev-1", 1)]).await.unwrap_err();
            assert!(matches!(err, Error::Storage(_)));
        });
    }

    #[tokio::test]
    async fn test_observation_query_filters_and_orders() {
        let store = MemoryStore::new();
        store
            .insert_observations(&[obs("dev-1", 10), obs("dev-1", 30), obs("dev-2", 20)])
            .await
            .unwrap();

        let query = ObservationQuery {
            device_id: Some("dev-1".to_string()),
            ..Default::default()
        };
        let found = store.observations(&query).await.unwrap();
        let stamps: Vec<i64> = found.iter().map(|o| o.timestamp).collect();
        assert_eq!(stamps, vec![30, 10]);

        let query = ObservationQuery {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        };
        let found = store.observations(&query).await.unwrap();
        assert_eq!(found[0].timestamp, 20);
        assert_eq!(store.count_observations(&query).await.unwrap(), 3);
    }
}
