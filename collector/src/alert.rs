use std::str::FromStr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::metrics::NOTIFICATIONS_TOTAL;
use crate::model::{DeviceEntry, DeviceLimit, LimitType, Observation};
use crate::notify::{log_outcomes, Notifier, PushMessage, ALERT_CATEGORY};
use crate::store::Store;

const LOW_BATTERY_VOLTS: f64 = 3.2;
const DEFAULT_RECIPIENT_COLOUR: &str = "4c96fc";

/// How many simultaneous conditions one alert cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertPolicy {
    /// Only the highest-priority note.
    #[default]
    FirstOnly,
    /// Every note, combined into one message.
    BundleAll,
}

impl FromStr for AlertPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(AlertPolicy::FirstOnly),
            "bundle" => Ok(AlertPolicy::BundleAll),
            other => Err(Error::Config(format!("unknown alert policy {:?}", other))),
        }
    }
}

/// A condition found in one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Note {
    Battery,
    Motion(i32),
    Brightness(i32),
    Humidity(i32),
    Temperature { celsius: f64, fahrenheit: bool },
}

impl Note {
    pub fn kind(&self) -> &'static str {
        match self {
            Note::Battery => "Battery",
            Note::Motion(_) => "Movement",
            Note::Brightness(_) => "Brightness",
            Note::Humidity(_) => "Humidity",
            Note::Temperature { .. } => "Temperature",
        }
    }

    pub fn text(&self) -> String {
        match self {
            Note::Battery => "battery is low".to_string(),
            Note::Motion(count) => format!("has been moved over {} times", count),
            Note::Brightness(level) => format!("light level is reaching {}%", level),
            Note::Humidity(level) => format!("humidity is reaching {}%", level),
            Note::Temperature {
                celsius,
                fahrenheit,
            } => format!(
                "temperature is reaching {}",
                format_temperature(*celsius, *fahrenheit)
            ),
        }
    }
}

fn format_temperature(celsius: f64, fahrenheit: bool) -> String {
    if fahrenheit {
        format!("{:.1}°F", celsius * 9.0 / 5.0 + 32.0)
    } else {
        format!("{:.1}°C", celsius)
    }
}

/// Alert text shared by every recipient of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    /// Comma separated note kinds.
    pub types: String,
}

impl AlertMessage {
    /// `None` when there is nothing to report.
    pub fn compose(device_name: &str, notes: &[Note]) -> Option<Self> {
        match notes {
            [] => None,
            [only] => Some(AlertMessage {
                title: format!("{} Alert", only.kind()),
                body: format!("{} {}", device_name, only.text()),
                types: only.kind().to_string(),
            }),
            many => {
                let types = many.iter().map(Note::kind).collect::<Vec<_>>().join(", ");
                let lines = many
                    .iter()
                    .map(|n| format!("- {}", n.text()))
                    .collect::<Vec<_>>()
                    .join("\n");
                Some(AlertMessage {
                    title: format!("Alert: {}", types),
                    body: format!("{} has multiple alerts: \n{}", device_name, lines),
                    types,
                })
            }
        }
    }
}

/// One recipient's share of an alert, as handed to the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDelivery {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub tokens: Vec<String>,
    pub colour: String,
    pub delivered: usize,
}

/// Last notification time per (user, device), in epoch seconds.
#[derive(Debug, Default)]
pub struct DebounceTracker {
    last_sent: DashMap<(Uuid, String), i64>,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send and return true unless the previous send for this pair
    /// is less than `window_secs` old.
    pub fn should_send(&self, user_id: Uuid, device_id: &str, now: i64, window_secs: i64) -> bool {
        match self.last_sent.entry((user_id, device_id.to_string())) {
            Entry::Occupied(mut last) => {
                if now >= *last.get() + window_secs {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

/// Unpack a stored percentage window: low in bits 0–7, high in bits 8–15,
/// both clamped to [0, 100] and ordered.
pub fn threshold_bounds(value: f32) -> (i32, i32) {
    let v = value as u16;
    let low = i32::from(v & 0x00FF).clamp(0, 100);
    let high = i32::from((v & 0xFF00) >> 8).clamp(0, 100);
    if low > high {
        (high, low)
    } else {
        (low, high)
    }
}

/// Movement counter carried in the low half of `accel_x`; zero unless the
/// other axes report activity.
pub fn movements(obs: &Observation) -> i32 {
    let counter = obs.accel_x & 0xFFFF;
    if obs.accel_y == 0 && (obs.accel_z & 0xFFFF) == 0 {
        0
    } else {
        counter
    }
}

fn first_limit(limits: &[DeviceLimit], kind: LimitType) -> Option<&DeviceLimit> {
    limits.iter().find(|l| l.kind() == Some(kind))
}

fn outside(value: i32, limit: Option<&DeviceLimit>) -> bool {
    match limit {
        Some(limit) => {
            let (low, high) = threshold_bounds(limit.limit_value);
            value < low || value > high
        }
        None => false,
    }
}

/// Conditions raised by `obs` against the owner's limits, in priority order:
/// battery, motion, brightness, humidity, temperature.
pub fn notes_for(obs: &Observation, limits: &[DeviceLimit]) -> Vec<Note> {
    let mut notes = Vec::new();

    if obs.battery < LOW_BATTERY_VOLTS {
        notes.push(Note::Battery);
    }

    let moved = movements(obs);
    debug!(
        "motional data: {}, {}, {}, {}",
        obs.accel_x, obs.accel_y, obs.accel_z, moved
    );
    if moved > 0 {
        notes.push(Note::Motion(obs.accel_x & 0xFFFF));
    }

    if outside(obs.light, first_limit(limits, LimitType::LightLevel)) {
        notes.push(Note::Brightness(obs.light));
    }
    if outside(obs.humidity, first_limit(limits, LimitType::HumidityLevel)) {
        notes.push(Note::Humidity(obs.humidity));
    }

    if let (Some(low), Some(high)) = (
        first_limit(limits, LimitType::TempLow),
        first_limit(limits, LimitType::TempHigh),
    ) {
        let (low, high) = (f64::from(low.limit_value), f64::from(high.limit_value));
        if obs.temperature < low || obs.temperature > high {
            let fahrenheit =
                first_limit(limits, LimitType::TempScale).is_some_and(|s| s.limit_value > 0.0);
            notes.push(Note::Temperature {
                celsius: obs.temperature,
                fahrenheit,
            });
        }
    }

    notes
}

/// Evaluates delegate observations and fans alerts out to subscribed users.
#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    debounce: Arc<DebounceTracker>,
    policy: AlertPolicy,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        debounce: Arc<DebounceTracker>,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            debounce,
            policy,
        }
    }

    /// Run one alert cycle for `obs` at `now` (epoch seconds). Returns the
    /// deliveries handed to the notifier.
    pub async fn evaluate(&self, obs: &Observation, now: i64) -> Result<Vec<AlertDelivery>> {
        if obs.is_null() {
            return Ok(Vec::new());
        }
        let Some(device) = self.store.device(&obs.device_id).await? else {
            debug!("No directory entry for {}, skipping alerts", obs.device_id);
            return Ok(Vec::new());
        };
        let Some(owner) = device.owner_id else {
            return Ok(Vec::new());
        };

        let limits = self.store.device_limits(&obs.device_id, owner).await?;
        let mut notes = notes_for(obs, &limits);
        if self.policy == AlertPolicy::FirstOnly {
            notes.truncate(1);
        }

        let name = device.display_name();
        let Some(message) = AlertMessage::compose(&name, &notes) else {
            return Ok(Vec::new());
        };
        info!("Alert for {}: {}", obs.device_id, message.title);
        self.store
            .append_chat_log(&obs.device_id, &message.body)
            .await?;

        let triggers = self.store.notification_limits(&obs.device_id).await?;
        let mut deliveries = Vec::new();
        for trigger in triggers {
            let tokens = self.store.recipient_tokens(trigger.user_id).await?;
            if tokens.is_empty() {
                continue;
            }
            let window = trigger.limit_value as i64;
            if !self
                .debounce
                .should_send(trigger.user_id, &obs.device_id, now, window)
            {
                info!("Skipping notification {}/{}", trigger.user_id, obs.device_id);
                NOTIFICATIONS_TOTAL.with_label_values(&["suppressed"]).inc();
                continue;
            }

            let colour = self.recipient_colour(&obs.device_id, trigger.user_id).await?;
            let push = PushMessage {
                title: message.title.clone(),
                body: message.body.clone(),
                category: ALERT_CATEGORY.to_string(),
                thread_id: obs.device_id.clone(),
                payload: push_payload(obs, &device, &name, &colour, trigger.user_id, &message),
            };
            let outcomes = self.notifier.push(&push, &tokens).await;
            let delivered = log_outcomes(&obs.device_id, &outcomes);
            NOTIFICATIONS_TOTAL
                .with_label_values(&["sent"])
                .inc_by(delivered as f64);
            NOTIFICATIONS_TOTAL
                .with_label_values(&["failed"])
                .inc_by((outcomes.len() - delivered) as f64);

            deliveries.push(AlertDelivery {
                user_id: trigger.user_id,
                title: push.title,
                body: push.body,
                tokens,
                colour,
                delivered,
            });
        }
        Ok(deliveries)
    }

    async fn recipient_colour(&self, device_id: &str, user_id: Uuid) -> Result<String> {
        let limits = self.store.device_limits(device_id, user_id).await?;
        Ok(first_limit(&limits, LimitType::Colour)
            .and_then(|l| l.limit_value_string.clone())
            .unwrap_or_else(|| DEFAULT_RECIPIENT_COLOUR.to_string()))
    }
}

fn push_payload(
    obs: &Observation,
    device: &DeviceEntry,
    name: &str,
    colour: &str,
    recipient: Uuid,
    message: &AlertMessage,
) -> Map<String, Value> {
    let payload = json!({
        "qbiq.name": name,
        "qbiq.id": obs.device_id,
        "qbiq.colour": colour,
        "qbiq.battery": obs.battery,
        "qbiq.charging": obs.charging,
        "qbiq.temperature": obs.temperature,
        "qbiq.humidity": obs.humidity,
        "qbiq.brightness": obs.light,
        "qbiq.movement": movements(obs),
        "qbiq.shared": device.owner_id != Some(recipient),
        "qbiq.notes": message.types,
        "qbiq.value": format_temperature(obs.temperature, false),
    });
    match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;

    const DEVICE: &str = "UBIQ0000A1B2C3";

    fn reading(temperature: f64) -> Observation {
        let mut obs = Observation::null(DEVICE.to_string(), "1.0.0".to_string(), None);
        obs.timestamp = 1_700_000_000_000;
        obs.battery = 3.9;
        obs.temperature = temperature;
        obs.light = 50;
        obs.humidity = 40;
        obs
    }

    fn limit(user: Uuid, kind: LimitType, value: f32) -> DeviceLimit {
        DeviceLimit::new(DEVICE, user, kind, value, None)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        evaluator: AlertEvaluator,
        owner: Uuid,
    }

    async fn fixture(policy: AlertPolicy, window: f32) -> Fixture {
        let owner = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        store
            .add_device(DeviceEntry {
                id: DEVICE.to_string(),
                name: "Kitchen".to_string(),
                owner_id: Some(owner),
                flags: 0,
            })
            .await;
        store.add_device_limit(limit(owner, LimitType::TempLow, 10.0)).await;
        store.add_device_limit(limit(owner, LimitType::TempHigh, 35.0)).await;
        store
            .add_device_limit(limit(owner, LimitType::Notifications, window))
            .await;
        store.add_recipient(owner, "token-1").await;

        let notifier = Arc::new(RecordingNotifier::new());
        let evaluator = AlertEvaluator::new(
            store.clone(),
            notifier.clone(),
            Arc::new(DebounceTracker::new()),
            policy,
        );
        Fixture {
            store,
            notifier,
            evaluator,
            owner,
        }
    }

    #[test]
    fn test_threshold_bounds() {
        assert_eq!(threshold_bounds(((80 << 8) | 20) as f32), (20, 80));
        assert_eq!(threshold_bounds(((10 << 8) | 80) as f32), (10, 80));
        assert_eq!(threshold_bounds(0xC8C8 as f32), (100, 100));
    }

    #[test]
    fn test_movements_need_other_axes() {
        let mut obs = reading(20.0);
        obs.accel_x = 0x0003_0005;
        assert_eq!(movements(&obs), 0);
        obs.accel_z = 1;
        assert_eq!(movements(&obs), 5);
    }

    #[test]
    fn test_note_order() {
        let user = Uuid::new_v4();
        let mut obs = reading(40.0);
        obs.battery = 3.1;
        obs.accel_x = 2;
        obs.accel_y = 1;
        obs.humidity = 90;
        let limits = vec![
            limit(user, LimitType::TempLow, 10.0),
            limit(user, LimitType::TempHigh, 35.0),
            limit(user, LimitType::TempScale, 1.0),
            limit(user, LimitType::HumidityLevel, ((60 << 8) | 20) as f32),
        ];
        let notes = notes_for(&obs, &limits);
        assert_eq!(
            notes,
            vec![
                Note::Battery,
                Note::Motion(2),
                Note::Humidity(90),
                Note::Temperature {
                    celsius: 40.0,
                    fahrenheit: true
                },
            ]
        );
        assert_eq!(notes[3].text(), "temperature is reaching 104.0°F");
    }

    #[test]
    fn test_compose_messages() {
        let single = AlertMessage::compose("Kitchen", &[Note::Battery]).unwrap();
        assert_eq!(single.title, "Battery Alert");
        assert_eq!(single.body, "Kitchen battery is low");

        let bundled =
            AlertMessage::compose("Kitchen", &[Note::Battery, Note::Humidity(90)]).unwrap();
        assert_eq!(bundled.title, "Alert: Battery, Humidity");
        assert_eq!(
            bundled.body,
            "Kitchen has multiple alerts: \n- battery is low\n- humidity is reaching 90%"
        );
        assert!(AlertMessage::compose("Kitchen", &[]).is_none());
    }

    #[test]
    fn test_debounce_window() {
        let tracker = DebounceTracker::new();
        let user = Uuid::new_v4();
        assert!(tracker.should_send(user, DEVICE, 1000, 60));
        assert!(!tracker.should_send(user, DEVICE, 1010, 60));
        assert!(tracker.should_send(user, DEVICE, 1070, 60));
        assert!(tracker.should_send(Uuid::new_v4(), DEVICE, 1071, 60));
    }

    #[tokio::test]
    async fn test_temperature_alert_and_quiet_reading() {
        let f = fixture(AlertPolicy::FirstOnly, 60.0).await;

        let deliveries = f.evaluator.evaluate(&reading(36.0), 1000).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].title, "Temperature Alert");
        assert_eq!(deliveries[0].body, "Kitchen temperature is reaching 36.0°C");
        assert_eq!(deliveries[0].colour, "4c96fc");
        assert_eq!(deliveries[0].user_id, f.owner);
        assert_eq!(f.store.chat_log().await.len(), 1);

        let deliveries = f.evaluator.evaluate(&reading(20.0), 2000).await.unwrap();
        assert!(deliveries.is_empty());
        assert_eq!(f.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_debounced_fan_out() {
        let f = fixture(AlertPolicy::FirstOnly, 60.0).await;
        f.evaluator.evaluate(&reading(36.0), 1000).await.unwrap();
        f.evaluator.evaluate(&reading(36.0), 1010).await.unwrap();
        assert_eq!(f.notifier.sent().await.len(), 1);

        f.evaluator.evaluate(&reading(36.0), 1080).await.unwrap();
        assert_eq!(f.notifier.sent().await.len(), 2);
        // Every alert is logged even when the push is suppressed.
        assert_eq!(f.store.chat_log().await.len(), 3);
    }

    #[tokio::test]
    async fn test_policy_controls_bundling() {
        let mut obs = reading(36.0);
        obs.battery = 3.0;

        let first = fixture(AlertPolicy::FirstOnly, 60.0).await;
        let deliveries = first.evaluator.evaluate(&obs, 1000).await.unwrap();
        assert_eq!(deliveries[0].title, "Battery Alert");

        let bundle = fixture(AlertPolicy::BundleAll, 60.0).await;
        let deliveries = bundle.evaluator.evaluate(&obs, 1000).await.unwrap();
        assert_eq!(deliveries[0].title, "Alert: Battery, Temperature");
    }

    #[tokio::test]
    async fn test_shared_recipient_payload() {
        let f = fixture(AlertPolicy::FirstOnly, 60.0).await;
        let guest = Uuid::new_v4();
        f.store
            .add_device_limit(limit(guest, LimitType::Notifications, 30.0))
            .await;
        f.store
            .add_device_limit(DeviceLimit::new(
                DEVICE,
                guest,
                LimitType::Colour,
                0.0,
                Some("ff0000"),
            ))
            .await;
        f.store.add_recipient(guest, "token-guest").await;

        let deliveries = f.evaluator.evaluate(&reading(36.0), 1000).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        let sent = f.notifier.sent().await;
        let guest_push = sent
            .iter()
            .find(|(_, tokens)| tokens == &vec!["token-guest".to_string()])
            .unwrap();
        assert_eq!(guest_push.0.payload["qbiq.shared"], json!(true));
        assert_eq!(guest_push.0.payload["qbiq.colour"], json!("ff0000"));
        assert_eq!(guest_push.0.payload["qbiq.notes"], json!("Temperature"));
    }

    #[tokio::test]
    async fn test_null_record_never_alerts() {
        let f = fixture(AlertPolicy::BundleAll, 60.0).await;
        let mut obs = reading(99.0);
        obs.timestamp = 0;
        assert!(f.evaluator.evaluate(&obs, 1000).await.unwrap().is_empty());
        assert!(f.store.chat_log().await.is_empty());
    }
}
