//! Hand-off point to the push delivery service.
//!
//! Delivery itself (APNs) lives outside the collector; the collector only
//! builds messages and records what the transport reported back.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::errors::{Error, Result};

pub const ALERT_CATEGORY: &str = "qbiq.alert";

/// Credentials and routing for the push service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub key_name: String,
    pub key_id: String,
    pub team_id: String,
    pub topic: String,
    pub production: bool,
}

#[derive(Debug, Deserialize)]
struct NotificationFile {
    notifications: Option<NotificationConfig>,
}

impl NotificationConfig {
    /// Read `{"notifications": {...}}` from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw)
            .map_err(|e| Error::Config(format!("invalid notification config {}: {}", path.display(), e)))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: NotificationFile = serde_json::from_str(raw)?;
        file.notifications
            .ok_or_else(|| Error::Config("missing \"notifications\" section".to_string()))
    }
}

/// One alert push, shared by every token of a recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub category: String,
    /// Groups notifications of the same device on the handset.
    pub thread_id: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub token: String,
    pub status: DeliveryStatus,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Push one message to every token; one outcome per token.
    async fn push(&self, message: &PushMessage, tokens: &[String]) -> Vec<PushOutcome>;
}

/// Writes pushes to the log. Used when no push transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier {
    config: Option<NotificationConfig>,
}

impl LogNotifier {
    pub fn new(config: Option<NotificationConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn push(&self, message: &PushMessage, tokens: &[String]) -> Vec<PushOutcome> {
        let topic = self.config.as_ref().map_or("-", |c| c.topic.as_str());
        tokens
            .iter()
            .map(|token| {
                info!(
                    "push [{}] to {}: {} / {}",
                    topic, token, message.title, message.body
                );
                PushOutcome {
                    token: token.clone(),
                    status: DeliveryStatus::Delivered,
                }
            })
            .collect()
    }
}

/// Keeps every push in memory; tokens listed in `reject` fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(PushMessage, Vec<String>)>>,
    reject: Vec<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(tokens: &[&str]) -> Self {
        Self {
            sent: Mutex::default(),
            reject: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub async fn sent(&self) -> Vec<(PushMessage, Vec<String>)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn push(&self, message: &PushMessage, tokens: &[String]) -> Vec<PushOutcome> {
        self.sent
            .lock()
            .await
            .push((message.clone(), tokens.to_vec()));
        tokens
            .iter()
            .map(|token| {
                let status = if self.reject.contains(token) {
                    DeliveryStatus::Rejected("BadDeviceToken".to_string())
                } else {
                    DeliveryStatus::Delivered
                };
                PushOutcome {
                    token: token.clone(),
                    status,
                }
            })
            .collect()
    }
}

/// Log per-token outcomes; failed deliveries are not retried.
pub fn log_outcomes(device_id: &str, outcomes: &[PushOutcome]) -> usize {
    let mut delivered = 0;
    for outcome in outcomes {
        match &outcome.status {
            DeliveryStatus::Delivered => {
                delivered += 1;
                info!("Notification for {} delivered to {}", device_id, outcome.token);
            }
            DeliveryStatus::Rejected(reason) => {
                error!(
                    "Notification for {} failed for {}: {}",
                    device_id, outcome.token, reason
                );
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> PushMessage {
        PushMessage {
            title: "Battery Alert".to_string(),
            body: "Kitchen battery is low".to_string(),
            category: ALERT_CATEGORY.to_string(),
            thread_id: "UBIQ1".to_string(),
            payload: Map::new(),
        }
    }

    #[test]
    fn test_parse_config() {
        let raw = r#"{"notifications": {"keyName": "AuthKey.p8", "keyId": "K1",
                      "teamId": "T1", "topic": "com.example.qbiq", "production": false}}"#;
        let config = NotificationConfig::parse(raw).unwrap();
        assert_eq!(config.topic, "com.example.qbiq");
        assert!(!config.production);
    }

    #[test]
    fn test_missing_section_is_config_error() {
        let err = NotificationConfig::parse("{}").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_log_notifier_delivers_every_token() {
        let notifier = LogNotifier::new(None);
        let tokens = vec!["a".to_string(), "b".to_string()];
        let outcomes = tokio_test::block_on(notifier.push(&message(), &tokens));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(log_outcomes("UBIQ1", &outcomes), 2);
    }

    #[tokio::test]
    async fn test_recording_notifier_rejects_listed_tokens() {
        let notifier = RecordingNotifier::rejecting(&["bad"]);
        let tokens = vec!["good".to_string(), "bad".to_string()];
        let outcomes = notifier.push(&message(), &tokens).await;
        assert_eq!(log_outcomes("UBIQ1", &outcomes), 1);
        assert_eq!(notifier.sent().await.len(), 1);
    }
}
