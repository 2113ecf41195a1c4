use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SESSIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_sessions_total",
        "Total device connections accepted"
    ))
    .unwrap();
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::with_opts(Opts::new(
        "collector_active_sessions",
        "Device sessions currently open"
    ))
    .unwrap();
    pub static ref PROTOCOL_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_protocol_errors_total",
        "Total reports rejected as malformed or unsupported"
    ))
    .unwrap();
    pub static ref PERSISTENCE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_persistence_failures_total",
        "Total failed storage operations, including retried inserts"
    ))
    .unwrap();
    pub static ref OBSERVATIONS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_observations_stored_total",
        "Total observations persisted"
    ))
    .unwrap();
    pub static ref RESPONSES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("collector_responses_total", "Responses sent, by status"),
        &["status"]
    )
    .unwrap();
    pub static ref FEEDBACK_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "collector_feedback_total",
            "Checksum confirmations from version 3 devices, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref NOTIFICATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "collector_notifications_total",
            "Alert notifications, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref SESSION_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "collector_session_latency_seconds",
            "Time from first header byte to response written"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone()))?;
    REGISTRY.register(Box::new(PROTOCOL_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PERSISTENCE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OBSERVATIONS_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FEEDBACK_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NOTIFICATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SESSION_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_after_init() {
        // Other tests in the binary may have registered already.
        let _ = init_metrics();
        SESSIONS_TOTAL.inc();
        RESPONSES_TOTAL.with_label_values(&["ok"]).inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("collector_sessions_total"));
        assert!(text.contains("collector_responses_total{status=\"ok\"}"));
    }
}
