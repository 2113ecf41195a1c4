//! Persistence seam used by sessions, resolvers and the alert evaluator.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{make_pool, PgStore};

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    DeviceEntry, DeviceLimit, FirmwareRecord, FirmwareType, Observation,
    ObservationQuery, PendingLimit,
};

/// Storage operations the collector needs.
///
/// Implementations:
/// - `PgStore`: Postgres backend used in production
/// - `MemoryStore`: in-process backend for tests and local runs
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Append observations; null records must already be filtered out.
    async fn insert_observations(&self, batch: &[Observation]) -> Result<()>;

    /// Read every pending limit for a device in one transaction, deleting
    /// them in the same transaction when `remove` is set.
    async fn take_pending_limits(&self, device_id: &str, remove: bool) -> Result<Vec<PendingLimit>>;

    /// Delete the delivered rows once the device confirmed them. A row whose
    /// value was replaced after delivery is left queued.
    async fn delete_pending_limits(&self, device_id: &str, delivered: &[PendingLimit]) -> Result<()>;

    async fn firmware(&self, version: &str, kind: FirmwareType) -> Result<Option<FirmwareRecord>>;

    /// Firmware of one type that nothing obsoletes yet.
    async fn current_firmware(&self, kind: FirmwareType) -> Result<Vec<FirmwareRecord>>;

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>>;

    async fn device_limits(&self, device_id: &str, user_id: Uuid) -> Result<Vec<DeviceLimit>>;

    /// Enabled notification limits for a device, across all users.
    async fn notification_limits(&self, device_id: &str) -> Result<Vec<DeviceLimit>>;

    /// Push tokens registered under any alias of the user.
    async fn recipient_tokens(&self, user_id: Uuid) -> Result<Vec<String>>;

    async fn append_chat_log(&self, device_id: &str, content: &str) -> Result<()>;

    /// Stored observations, newest first.
    async fn observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>>;

    /// Number of observations matching the query's filters, ignoring paging.
    async fn count_observations(&self, query: &ObservationQuery) -> Result<u64>;
}
