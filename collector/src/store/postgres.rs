use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Store;
use crate::errors::{Error, Result};
use crate::metrics::PERSISTENCE_FAILURES_TOTAL;
use crate::model::{
    DeviceEntry, DeviceLimit, FirmwareRecord, FirmwareType, LimitType, Observation,
    ObservationQuery, PendingLimit,
};

const OBSERVATION_COLUMNS: &str = "device_id, obstime AS timestamp, charging, firmware, \
     wifi_firmware, battery, temperature, light, humidity, accel_x, accel_y, accel_z";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_observations_inner(&self, batch: &[Observation]) -> Result<()> {
        let device_ids: Vec<&str> = batch.iter().map(|o| o.device_id.as_str()).collect();
        let timestamps: Vec<i64> = batch.iter().map(|o| o.timestamp).collect();
        let charging: Vec<bool> = batch.iter().map(|o| o.charging).collect();
        let firmware: Vec<&str> = batch.iter().map(|o| o.firmware.as_str()).collect();
        let wifi_firmware: Vec<Option<&str>> =
            batch.iter().map(|o| o.wifi_firmware.as_deref()).collect();
        let batteries: Vec<f64> = batch.iter().map(|o| o.battery).collect();
        let temperatures: Vec<f64> = batch.iter().map(|o| o.temperature).collect();
        let lights: Vec<i32> = batch.iter().map(|o| o.light).collect();
        let humidities: Vec<i32> = batch.iter().map(|o| o.humidity).collect();
        let accel_x: Vec<i32> = batch.iter().map(|o| o.accel_x).collect();
        let accel_y: Vec<i32> = batch.iter().map(|o| o.accel_y).collect();
        let accel_z: Vec<i32> = batch.iter().map(|o| o.accel_z).collect();

        let query = r#"
            INSERT INTO obs (device_id, obstime, charging, firmware, wifi_firmware, battery,
                             temperature, light, humidity, accel_x, accel_y, accel_z)
            SELECT * FROM UNNEST($1::text[], $2::int8[], $3::bool[], $4::text[], $5::text[],
                                 $6::float8[], $7::float8[], $8::int4[], $9::int4[],
                                 $10::int4[], $11::int4[], $12::int4[])
            "#;

        sqlx::query(query)
            .bind(&device_ids)
            .bind(&timestamps)
            .bind(&charging)
            .bind(&firmware)
            .bind(&wifi_firmware)
            .bind(&batteries)
            .bind(&temperatures)
            .bind(&lights)
            .bind(&humidities)
            .bind(&accel_x)
            .bind(&accel_y)
            .bind(&accel_z)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_observations(&self, batch: &[Observation]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 3;

        loop {
            attempts += 1;
            match self.insert_observations_inner(batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err))
                    if attempts < max_attempts && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1);
                    warn!(
                        "Observation insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    PERSISTENCE_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Observation insert failed permanently after {} attempts: {}",
                        attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn take_pending_limits(&self, device_id: &str, remove: bool) -> Result<Vec<PendingLimit>> {
        let mut tx = self.pool.begin().await?;
        let limits: Vec<PendingLimit> = sqlx::query_as(
            r#"
            SELECT device_id, limit_type, limit_value, limit_value_string
            FROM device_push_limits
            WHERE device_id = $1
            FOR UPDATE
            "#,
        )
        .bind(device_id)
        .fetch_all(&mut *tx)
        .await?;

        if remove && !limits.is_empty() {
            sqlx::query("DELETE FROM device_push_limits WHERE device_id = $1")
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("Loaded {} pending limits for {}", limits.len(), device_id);
        Ok(limits)
    }

    async fn delete_pending_limits(&self, device_id: &str, delivered: &[PendingLimit]) -> Result<()> {
        if delivered.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for limit in delivered {
            deleted += sqlx::query(
                r#"
                DELETE FROM device_push_limits
                WHERE device_id = $1
                  AND limit_type = $2
                  AND limit_value = $3
                  AND limit_value_string IS NOT DISTINCT FROM $4
                "#,
            )
            .bind(device_id)
            .bind(limit.limit_type)
            .bind(limit.limit_value)
            .bind(limit.limit_value_string.as_deref())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        debug!(
            "Confirmed {} of {} delivered limits for {}",
            deleted,
            delivered.len(),
            device_id
        );
        Ok(())
    }

    async fn firmware(&self, version: &str, kind: FirmwareType) -> Result<Option<FirmwareRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT version, firmware_type, obsoleted_by
            FROM device_firmware
            WHERE version = $1 AND firmware_type = $2
            "#,
        )
        .bind(version)
        .bind(kind.raw())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn current_firmware(&self, kind: FirmwareType) -> Result<Vec<FirmwareRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT version, firmware_type, obsoleted_by
            FROM device_firmware
            WHERE obsoleted_by IS NULL AND firmware_type = $1
            "#,
        )
        .bind(kind.raw())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>> {
        let device = sqlx::query_as("SELECT id, name, owner_id, flags FROM devices WHERE id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn device_limits(&self, device_id: &str, user_id: Uuid) -> Result<Vec<DeviceLimit>> {
        let limits = sqlx::query_as(
            r#"
            SELECT device_id, user_id, limit_type, limit_value, limit_value_string
            FROM device_limits
            WHERE device_id = $1 AND user_id = $2
            "#,
        )
        .bind(device_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(limits)
    }

    async fn notification_limits(&self, device_id: &str) -> Result<Vec<DeviceLimit>> {
        let limits = sqlx::query_as(
            r#"
            SELECT device_id, user_id, limit_type, limit_value, limit_value_string
            FROM device_limits
            WHERE device_id = $1 AND limit_type = $2 AND limit_value <> 0
            "#,
        )
        .bind(device_id)
        .bind(LimitType::Notifications.raw())
        .fetch_all(&self.pool)
        .await?;
        Ok(limits)
    }

    async fn recipient_tokens(&self, user_id: Uuid) -> Result<Vec<String>> {
        let tokens: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT m.device_id
            FROM mobile_device_ids m
            JOIN aliases a ON a.address = m.alias_id
            WHERE a.account = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens.into_iter().map(|(t,)| t).collect())
    }

    async fn append_chat_log(&self, device_id: &str, content: &str) -> Result<()> {
        sqlx::query("INSERT INTO chatlog (topic, poster, content) VALUES ($1, $1, $2)")
            .bind(device_id)
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>> {
        let limit = query.limit.unwrap_or(100).min(1000);
        let offset = query.offset.unwrap_or(0);

        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM obs", OBSERVATION_COLUMNS));
        push_observation_filter(&mut builder, query);
        builder
            .push(" ORDER BY obstime DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        Ok(builder.build_query_as::<Observation>().fetch_all(&self.pool).await?)
    }

    async fn count_observations(&self, query: &ObservationQuery) -> Result<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM obs");
        push_observation_filter(&mut builder, query);
        let count: i64 = builder.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

/// WHERE clause shared by the page and count queries. `limit` and `offset`
/// are ignored here.
fn push_observation_filter(builder: &mut QueryBuilder<'_, Postgres>, query: &ObservationQuery) {
    let mut separator = " WHERE ";
    if let Some(device_id) = &query.device_id {
        builder.push(separator).push("device_id = ").push_bind(device_id.clone());
        separator = " AND ";
    }
    if let Some(start) = &query.start {
        builder.push(separator).push("obstime >= ").push_bind(start.timestamp_millis());
        separator = " AND ";
    }
    if let Some(end) = &query.end {
        builder.push(separator).push("obstime <= ").push_bind(end.timestamp_millis());
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
