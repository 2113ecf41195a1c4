#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use biq_collector::alert::{AlertPolicy, DebounceTracker};
use biq_collector::config::SessionSettings;
use biq_collector::notify::Notifier;
use biq_collector::protocol::{BatchRecord, BatchReport, HEADER_LEN};
use biq_collector::server;
use biq_collector::session::SessionContext;
use biq_collector::store::Store;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const DEVICE: &str = "UBIQ0000A1B2C3";

/// Start a collector on an ephemeral port.
pub async fn spawn_collector(
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    policy: AlertPolicy,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = SessionContext::new(
        store,
        notifier,
        Arc::new(DebounceTracker::new()),
        policy,
        SessionSettings {
            read_timeout: Duration::from_secs(2),
            feedback_timeout: Duration::from_millis(300),
        },
    );
    tokio::spawn(server::serve(listener, ctx));
    addr
}

pub fn record(offset: i32, temperature: i16) -> BatchRecord {
    BatchRecord {
        clock_offset: offset,
        battery: 390,
        temperature,
        rh_temperature: temperature,
        humidity: 45,
        light: 60,
        ..Default::default()
    }
}

pub fn batch(device_id: &str, records: Vec<BatchRecord>) -> BatchReport {
    BatchReport {
        clock: 5000,
        reserved: 0,
        records,
        device_id: device_id.to_string(),
        boot_fw: "1.0.0".to_string(),
        wifi_fw: "esp1".to_string(),
    }
}

/// Read one whole response frame.
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN];
    stream.read_exact(&mut frame).await.unwrap();
    let length = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    frame.resize(length, 0);
    stream.read_exact(&mut frame[HEADER_LEN..]).await.unwrap();
    frame
}

/// Send a frame and return the reply, leaving the connection open.
pub async fn send(addr: SocketAddr, frame: &[u8]) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(frame).await.unwrap();
    let reply = read_frame(&mut stream).await;
    (stream, reply)
}

/// Wait until the server side has closed the connection.
pub async fn wait_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
}
