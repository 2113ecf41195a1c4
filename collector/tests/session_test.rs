mod common;

use std::sync::Arc;
use std::time::Duration;

use biq_collector::alert::AlertPolicy;
use biq_collector::model::{
    DeviceEntry, DeviceLimit, FirmwareRecord, FirmwareType, LimitType, PendingLimit,
};
use biq_collector::notify::RecordingNotifier;
use biq_collector::protocol::{
    checksum, status, ReportValue, Response, ResponseValue, TaggedReport, PROTO_V2, PROTO_V3,
};
use biq_collector::store::MemoryStore;
use common::{batch, record, send, spawn_collector, wait_closed, DEVICE};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

async fn collector(policy: AlertPolicy) -> (Arc<MemoryStore>, Arc<RecordingNotifier>, std::net::SocketAddr) {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let addr = spawn_collector(store.clone(), notifier.clone(), policy).await;
    (store, notifier, addr)
}

/// Alerts run after the connection closes; poll until they land.
async fn wait_for_pushes(notifier: &RecordingNotifier, expected: usize) -> usize {
    for _ in 0..50 {
        let sent = notifier.sent().await.len();
        if sent >= expected {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    notifier.sent().await.len()
}

async fn owned_device(store: &MemoryStore) -> Uuid {
    let owner = Uuid::new_v4();
    store
        .add_device(DeviceEntry {
            id: DEVICE.to_string(),
            name: "Nursery".to_string(),
            owner_id: Some(owner),
            flags: 1,
        })
        .await;
    for (kind, value) in [
        (LimitType::TempLow, 10.0),
        (LimitType::TempHigh, 35.0),
        (LimitType::Notifications, 60.0),
    ] {
        store
            .add_device_limit(DeviceLimit::new(DEVICE, owner, kind, value, None))
            .await;
    }
    store.add_recipient(owner, "phone-1").await;
    owner
}

#[tokio::test]
async fn test_unsupported_version_gets_protocol_error() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;

    let (mut stream, reply) = send(addr, &[4, 0, 99, 0]).await;
    assert_eq!(reply, vec![4, 0, 1, status::PROTOCOL_ERROR]);
    wait_closed(&mut stream).await;
    assert!(store.stored_observations().await.is_empty());
}

#[tokio::test]
async fn test_malformed_identity_gets_protocol_error() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    let mut report = batch(DEVICE, vec![record(5000, 210)]);
    report.wifi_fw = "esp1,extra".to_string();

    let (_, reply) = send(addr, &report.encode(PROTO_V2).unwrap()).await;
    assert_eq!(reply, vec![4, 0, 1, status::PROTOCOL_ERROR]);
    assert!(store.stored_observations().await.is_empty());
}

#[tokio::test]
async fn test_boot_upgrade_wins_over_wifi() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    store
        .add_firmware(FirmwareRecord::new("1.0.0", FirmwareType::Boot, Some("1.0.1")))
        .await;
    store
        .add_firmware(FirmwareRecord::new("esp1", FirmwareType::Wifi, Some("esp2")))
        .await;

    let frame = batch(DEVICE, vec![record(5000, 210)]).encode(PROTO_V2).unwrap();
    let (_, reply) = send(addr, &frame).await;
    let response = Response::decode(&reply).unwrap();

    assert_eq!(response.version, 1);
    assert_eq!(response.status, status::OK);
    let updates: Vec<&ResponseValue> = response
        .values
        .iter()
        .filter(|v| v.is_firmware_update())
        .collect();
    assert_eq!(updates, vec![&ResponseValue::UpdateBootFw]);
    assert_eq!(response.values.last(), Some(&ResponseValue::UpdateBootFw));
}

#[tokio::test]
async fn test_pending_limits_delivered_once() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    store
        .push_limit(PendingLimit::new(DEVICE, LimitType::Interval, 120.0, None))
        .await;
    store
        .push_limit(PendingLimit::new(DEVICE, LimitType::ReportBufferCapacity, 8.0, None))
        .await;

    let frame = batch(DEVICE, vec![record(5000, 210)]).encode(PROTO_V2).unwrap();
    let (_, reply) = send(addr, &frame).await;
    assert_eq!(
        Response::decode(&reply).unwrap().values,
        vec![
            ResponseValue::ReportInterval(120),
            ResponseValue::DeviceCapabilities { low: 0, high: 8 },
        ]
    );
    assert!(store.pending_limits(DEVICE).await.is_empty());

    let (_, reply) = send(addr, &frame).await;
    assert_eq!(
        Response::decode(&reply).unwrap().values,
        vec![ResponseValue::DeviceCapabilities { low: 0, high: 0 }]
    );
}

#[tokio::test]
async fn test_feedback_confirmation() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    store
        .push_limit(PendingLimit::new(DEVICE, LimitType::Colour, 0.0, Some("FF8000")))
        .await;
    let frame = batch(DEVICE, vec![record(5000, 210)]).encode(PROTO_V3).unwrap();

    // Wrong echo: limits stay queued.
    let (mut stream, reply) = send(addr, &frame).await;
    let wrong = checksum(&reply).wrapping_add(1);
    stream.write_all(&wrong.to_le_bytes()).await.unwrap();
    wait_closed(&mut stream).await;
    assert_eq!(store.pending_limits(DEVICE).await.len(), 1);

    // Correct echo: limits are cleared.
    let (mut stream, reply) = send(addr, &frame).await;
    assert!(Response::decode(&reply)
        .unwrap()
        .values
        .contains(&ResponseValue::LedColour { r: 0xFF, g: 0x80, b: 0 }));
    stream
        .write_all(&checksum(&reply).to_le_bytes())
        .await
        .unwrap();
    wait_closed(&mut stream).await;
    assert!(store.pending_limits(DEVICE).await.is_empty());
}

#[tokio::test]
async fn test_confirmation_keeps_limit_replaced_before_echo() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    store
        .push_limit(PendingLimit::new(DEVICE, LimitType::Interval, 300.0, None))
        .await;
    let frame = batch(DEVICE, vec![record(5000, 210)]).encode(PROTO_V3).unwrap();

    let (mut stream, reply) = send(addr, &frame).await;
    assert!(Response::decode(&reply)
        .unwrap()
        .values
        .contains(&ResponseValue::ReportInterval(300)));

    // Replaced while the device is still applying the first value.
    store
        .push_limit(PendingLimit::new(DEVICE, LimitType::Interval, 600.0, None))
        .await;
    stream
        .write_all(&checksum(&reply).to_le_bytes())
        .await
        .unwrap();
    wait_closed(&mut stream).await;

    assert_eq!(
        store.pending_limits(DEVICE).await,
        vec![PendingLimit::new(DEVICE, LimitType::Interval, 600.0, None)]
    );

    let (_, reply) = send(addr, &frame).await;
    assert!(Response::decode(&reply)
        .unwrap()
        .values
        .contains(&ResponseValue::ReportInterval(600)));
}

#[tokio::test]
async fn test_storage_outage_asks_device_to_retry() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    store.set_offline(true);

    let frame = batch(DEVICE, vec![record(5000, 210)]).encode(PROTO_V2).unwrap();
    let (mut stream, reply) = send(addr, &frame).await;
    assert_eq!(reply, vec![4, 0, 1, status::RETRY_REPORT_ERROR]);
    wait_closed(&mut stream).await;

    store.set_offline(false);
    let (_, reply) = send(addr, &frame).await;
    assert_eq!(Response::decode(&reply).unwrap().status, status::OK);
    assert_eq!(store.stored_observations().await.len(), 1);
}

#[tokio::test]
async fn test_tagged_report_is_stored() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;
    let report = TaggedReport {
        status: status::CHARGING,
        device_id: DEVICE.to_string(),
        boot_fw: "1.0.0".to_string(),
        wifi_fw: String::new(),
        values: vec![
            ReportValue::TemperatureOne(215),
            ReportValue::RelativeHumidity(40),
            ReportValue::BatteryVoltage(395),
        ],
    };

    let (_, reply) = send(addr, &report.encode().unwrap()).await;
    assert_eq!(Response::decode(&reply).unwrap().status, status::OK);

    let stored = store.stored_observations().await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].charging);
    assert_eq!(stored[0].temperature, 21.5);
    assert_eq!(stored[0].humidity, 40);
    assert_eq!(stored[0].wifi_firmware, None);
    assert!(stored[0].timestamp > 0);
}

#[tokio::test]
async fn test_only_last_record_drives_alerts() {
    let (store, notifier, addr) = collector(AlertPolicy::FirstOnly).await;
    owned_device(&store).await;

    // Hot early reading, normal last reading: stored, but no alert.
    let frame = batch(DEVICE, vec![record(4900, 400), record(5000, 200)])
        .encode(PROTO_V2)
        .unwrap();
    send(addr, &frame).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(notifier.sent().await.is_empty());
    assert_eq!(store.stored_observations().await.len(), 2);

    // Hot last reading alerts the owner.
    let frame = batch(DEVICE, vec![record(4900, 200), record(5000, 360)])
        .encode(PROTO_V2)
        .unwrap();
    send(addr, &frame).await;
    assert_eq!(wait_for_pushes(&notifier, 1).await, 1);

    let sent = notifier.sent().await;
    let (message, tokens) = &sent[0];
    assert_eq!(message.title, "Temperature Alert");
    assert_eq!(message.body, "Nursery temperature is reaching 36.0°C");
    assert_eq!(tokens, &vec!["phone-1".to_string()]);
    assert_eq!(store.chat_log().await.len(), 1);
}

#[tokio::test]
async fn test_repeat_alerts_are_debounced() {
    let (store, notifier, addr) = collector(AlertPolicy::FirstOnly).await;
    owned_device(&store).await;

    let frame = batch(DEVICE, vec![record(5000, 360)]).encode(PROTO_V2).unwrap();
    send(addr, &frame).await;
    assert_eq!(wait_for_pushes(&notifier, 1).await, 1);

    send(addr, &frame).await;
    for _ in 0..50 {
        if store.chat_log().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.chat_log().await.len(), 2);
    assert_eq!(notifier.sent().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_devices() {
    let (store, _, addr) = collector(AlertPolicy::FirstOnly).await;

    let mut tasks = Vec::new();
    for i in 0..25 {
        tasks.push(tokio::spawn(async move {
            let device_id = format!("UBIQ{:010}", i);
            let frame = batch(&device_id, vec![record(4990, 210), record(5000, 215)])
                .encode(PROTO_V2)
                .unwrap();
            let (_, reply) = send(addr, &frame).await;
            Response::decode(&reply).unwrap().status
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), status::OK);
    }
    assert_eq!(store.stored_observations().await.len(), 50);
}
