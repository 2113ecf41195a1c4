mod device;

use std::sync::Arc;
use std::time::{Duration, Instant};

use biq_collector::protocol::{checksum, status, FrameHeader, Response, HEADER_LEN};
use biq_collector::transport::FrameTransport;
use biq_collector::Result;
use clap::Parser;
use device::SimDevice;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "biq-simulator", about = "Simulated biq devices reporting to a collector")]
struct Args {
    /// Collector device listener
    #[arg(long, env = "COLLECTOR_ADDR", default_value = "127.0.0.1:8092")]
    addr: String,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Reports per second across all devices
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    /// Report version: 2 (batch) or 3 (batch with checksum feedback)
    #[arg(long, env = "PROTO_VERSION", default_value_t = 3,
          value_parser = clap::value_parser!(u8).range(2..=3))]
    version: u8,

    /// Buffered readings per report
    #[arg(long, env = "RECORDS", default_value_t = 4)]
    records: usize,

    /// Stop after this many reports
    #[arg(long, env = "TOTAL")]
    total: Option<u64>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("Starting biq simulator");
    info!(
        "Collector: {}, Rate: {} reports/s, Devices: {}, Version: {}",
        args.addr, args.rate, args.devices, args.version
    );

    let mut rng = rand::thread_rng();
    let devices: Vec<SimDevice> = (0..args.devices.max(1))
        .map(|i| SimDevice::new(i, &mut rng))
        .collect();
    let addr: Arc<str> = Arc::from(args.addr.as_str());

    const BURST_SIZE: u64 = 20;
    let burst_interval = Duration::from_millis((BURST_SIZE * 1000) / args.rate.max(1));
    info!(
        "Sending in bursts of {} reports every {:?}",
        BURST_SIZE, burst_interval
    );

    let mut next_device = 0usize;
    let mut sent = 0u64;
    let mut failed = 0u64;
    let mut echoed = 0u64;
    loop {
        let burst_start = Instant::now();
        let mut burst = JoinSet::new();

        for _ in 0..BURST_SIZE {
            let device = &devices[next_device % devices.len()];
            next_device += 1;
            let frame = match device.report(&mut rng, args.records).encode(args.version) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode report: {}", e);
                    failed += 1;
                    continue;
                }
            };
            let addr = addr.clone();
            let feedback = args.version > 2;
            burst.spawn(async move { exchange(&addr, &frame, feedback).await });
        }

        while let Some(joined) = burst.join_next().await {
            match joined {
                Ok(Ok(response)) if response.status == status::OK => {
                    sent += 1;
                    if args.version > 2 {
                        echoed += 1;
                    }
                    debug!("Response values: {:?}", response.values);
                }
                Ok(Ok(response)) => {
                    failed += 1;
                    warn!("Collector answered with status {}", response.status);
                }
                Ok(Err(e)) => {
                    failed += 1;
                    warn!("Exchange failed: {}", e);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Exchange task panicked: {}", e);
                }
            }
        }

        // Log progress periodically
        if sent % 1000 < BURST_SIZE {
            info!(
                "Sent {} reports ({} failed, {} echoed)",
                sent, failed, echoed
            );
        }
        if args.total.is_some_and(|total| sent + failed >= total) {
            info!("Done: {} sent, {} failed", sent, failed);
            return;
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - collector may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

/// One device contact: send the report, read the response and, for
/// version 3, echo its checksum.
async fn exchange(addr: &str, frame: &[u8], feedback: bool) -> Result<Response> {
    let stream = TcpStream::connect(addr).await?;
    let mut transport = FrameTransport::new(stream, Duration::from_secs(10));
    transport.write_exact(frame).await?;

    let mut reply = transport.read_exact(HEADER_LEN).await?;
    let header = FrameHeader::decode(&reply)?;
    reply.extend(transport.read_exact(header.payload_len()).await?);

    if feedback && header.status == status::OK {
        transport.write_exact(&checksum(&reply).to_le_bytes()).await?;
    }
    transport.shutdown().await;
    Response::decode(&reply)
}
