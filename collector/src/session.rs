//! One device exchange: read a report, persist it, answer with configuration
//! and firmware directives, optionally confirm, then raise alerts.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvaluator, AlertPolicy, DebounceTracker};
use crate::config::SessionSettings;
use crate::errors::{Error, ErrorClass, Result};
use crate::firmware::FirmwareResolver;
use crate::limits::LimitResolver;
use crate::metrics::{
    FEEDBACK_TOTAL, OBSERVATIONS_STORED_TOTAL, PERSISTENCE_FAILURES_TOTAL, PROTOCOL_ERRORS_TOTAL,
    RESPONSES_TOTAL, SESSION_LATENCY_SECONDS,
};
use crate::model::Observation;
use crate::notify::Notifier;
use crate::protocol::{checksum, decode_report, status, FrameHeader, Response, HEADER_LEN};
use crate::store::Store;
use crate::transport::FrameTransport;
use crate::validate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitHeader,
    AwaitBody,
    Decoded,
    Persisting,
    BuildingResponse,
    Sending,
    AwaitFeedback,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Response sent. `feedback` is set for version 3 devices: whether the
    /// echoed checksum matched.
    Completed { feedback: Option<bool> },
    /// Error reply sent with this status.
    Rejected { status: u8 },
    /// Connection dropped without a reply.
    Dropped,
}

/// Services every session borrows. Cloning is cheap.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub limits: LimitResolver,
    pub firmware: FirmwareResolver,
    pub alerts: AlertEvaluator,
    pub settings: SessionSettings,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        debounce: Arc<DebounceTracker>,
        policy: AlertPolicy,
        settings: SessionSettings,
    ) -> Self {
        Self {
            limits: LimitResolver::new(store.clone()),
            firmware: FirmwareResolver::new(store.clone()),
            alerts: AlertEvaluator::new(store.clone(), notifier, debounce, policy),
            store,
            settings,
        }
    }
}

pub struct ProtocolSession<S> {
    ctx: SessionContext,
    transport: FrameTransport<S>,
    state: SessionState,
}

impl<S> ProtocolSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ctx: SessionContext, stream: S) -> Self {
        let transport = FrameTransport::new(stream, ctx.settings.read_timeout);
        Self {
            ctx,
            transport,
            state: SessionState::AwaitHeader,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the exchange to completion. Never fails: errors become error
    /// replies or a dropped connection.
    pub async fn run(mut self) -> SessionOutcome {
        let outcome = match self.exchange().await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(e).await,
        };
        self.transport.shutdown().await;
        outcome
    }

    async fn exchange(&mut self) -> Result<SessionOutcome> {
        let raw = self.transport.read_exact(HEADER_LEN).await?;
        let started = Instant::now();
        let header = FrameHeader::decode(&raw)?;
        if !header.is_supported_report() {
            return Err(Error::protocol(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }

        self.transition(SessionState::AwaitBody);
        let payload = self.transport.read_exact(header.payload_len()).await?;
        let records = decode_report(&header, &payload, Utc::now())?;
        for record in &records {
            validate(&record.observation)?;
        }
        self.transition(SessionState::Decoded);

        self.transition(SessionState::Persisting);
        let batch: Vec<Observation> = records
            .iter()
            .filter(|r| !r.observation.is_null())
            .map(|r| r.observation.clone())
            .collect();
        self.ctx.store.insert_observations(&batch).await?;
        OBSERVATIONS_STORED_TOTAL.inc_by(batch.len() as f64);
        let delegate = records
            .into_iter()
            .find(|r| r.delegate)
            .map(|r| r.observation)
            .ok_or_else(|| Error::protocol("report carried no records"))?;
        info!(
            "Report v{} from {}: {} stored",
            header.version,
            delegate.device_id,
            batch.len()
        );

        self.transition(SessionState::BuildingResponse);
        let confirm = header.wants_feedback();
        let resolved = self.ctx.limits.resolve(&delegate.device_id, !confirm).await?;
        let mut values = resolved.values;
        if let Some(directive) = self.ctx.firmware.directive(&delegate).await? {
            values.push(directive);
        }
        if !values.is_empty() {
            info!("Sending response values {:?}", values);
        }
        let frame = Response::ok(values).encode()?;

        self.transition(SessionState::Sending);
        self.transport.write_exact(&frame).await?;
        RESPONSES_TOTAL.with_label_values(&[status_label(status::OK)]).inc();
        SESSION_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        let feedback = if confirm {
            self.transition(SessionState::AwaitFeedback);
            let confirmed = self.await_feedback(checksum(&frame)).await;
            if confirmed && !resolved.consumed.is_empty() {
                if let Err(e) = self
                    .ctx
                    .limits
                    .commit(&delegate.device_id, &resolved.consumed)
                    .await
                {
                    PERSISTENCE_FAILURES_TOTAL.inc();
                    error!(
                        "Failed to clear confirmed limits for {}: {}",
                        delegate.device_id, e
                    );
                }
            }
            Some(confirmed)
        } else {
            None
        };

        self.transport.shutdown().await;
        self.transition(SessionState::Closed);

        if let Err(e) = self
            .ctx
            .alerts
            .evaluate(&delegate, Utc::now().timestamp())
            .await
        {
            error!("Alert evaluation for {} failed: {}", delegate.device_id, e);
        }

        Ok(SessionOutcome::Completed { feedback })
    }

    /// Wait for the 2-byte checksum echo. Silence or a mismatch leaves the
    /// delivered limits queued for the next contact.
    async fn await_feedback(&mut self, expected: u16) -> bool {
        let limit = self.ctx.settings.feedback_timeout;
        match self.transport.read_exact_within(2, limit).await {
            Ok(echo) => {
                let received = u16::from_le_bytes([echo[0], echo[1]]);
                if received == expected {
                    FEEDBACK_TOTAL.with_label_values(&["confirmed"]).inc();
                    true
                } else {
                    warn!(
                        "Feedback checksum mismatch: expected {:#06x}, got {:#06x}",
                        expected, received
                    );
                    FEEDBACK_TOTAL.with_label_values(&["mismatch"]).inc();
                    false
                }
            }
            Err(e) => {
                debug!("No feedback from device: {}", e);
                FEEDBACK_TOTAL.with_label_values(&["missing"]).inc();
                false
            }
        }
    }

    async fn fail(&mut self, err: Error) -> SessionOutcome {
        self.transition(SessionState::Errored);
        let code = match err.class() {
            ErrorClass::Transport => {
                debug!("Dropping connection: {}", err);
                return SessionOutcome::Dropped;
            }
            ErrorClass::Persistence => {
                PERSISTENCE_FAILURES_TOTAL.inc();
                error!("Failure while saving report: {}. retryReportError", err);
                status::RETRY_REPORT_ERROR
            }
            ErrorClass::Protocol | ErrorClass::Fatal => {
                PROTOCOL_ERRORS_TOTAL.inc();
                warn!("Rejecting report: {}", err);
                status::PROTOCOL_ERROR
            }
        };

        let frame = match Response::error(code).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode error reply: {}", e);
                return SessionOutcome::Dropped;
            }
        };
        if let Err(e) = self.transport.write_exact(&frame).await {
            debug!("Error reply not delivered: {}", e);
            return SessionOutcome::Dropped;
        }
        RESPONSES_TOTAL.with_label_values(&[status_label(code)]).inc();
        SessionOutcome::Rejected { status: code }
    }
}

fn status_label(code: u8) -> &'static str {
    match code {
        status::OK => "ok",
        status::PROTOCOL_ERROR => "protocol_error",
        status::RETRY_REPORT_ERROR => "retry_report_error",
        _ => "other",
    }
}
