//! Delivers telemetry records to the sink with classified retries.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{StatusChangeEvent, TelemetryRecord};
use super::sink::{
    Sink, SinkConnector, SinkError, Table, check_row, complete_outage_row, open_outage_match,
    outage_match, outage_resolution, outage_start_row,
};

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub rate_limit_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 5.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep between attempt `attempt` and `attempt + 1`, counting from 0.
    pub fn delay_for(&self, attempt: u32, error: &SinkError) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.backoff_base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if matches!(error, SinkError::RateLimit(_)) {
            secs *= self.rate_limit_multiplier;
        }
        if !secs.is_finite() || secs > MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// A new row was written.
    Appended,
    /// An open outage row was resolved in place.
    Updated,
    /// No open row existed, so a complete resolved row was written.
    InsertedComplete,
    /// The sink already held the row; nothing was written.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub kind: AckKind,
    pub attempts: u32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("authentication failed after {attempts} attempts: {message}")]
    Auth { attempts: u32, message: String },
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimit { attempts: u32, message: String },
    #[error("transport failed after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },
    #[error("delivery failed after {attempts} attempts: {message}")]
    Unknown { attempts: u32, message: String },
}

impl DeliveryError {
    fn exhausted(last: SinkError, attempts: u32) -> Self {
        match last {
            SinkError::Auth(message) => DeliveryError::Auth { attempts, message },
            SinkError::RateLimit(message) => DeliveryError::RateLimit { attempts, message },
            SinkError::Transport(message) => DeliveryError::Transport { attempts, message },
            SinkError::Unknown(message) => DeliveryError::Unknown { attempts, message },
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Auth { attempts, .. }
            | DeliveryError::RateLimit { attempts, .. }
            | DeliveryError::Transport { attempts, .. }
            | DeliveryError::Unknown { attempts, .. } => *attempts,
        }
    }
}

struct Session {
    sink: Arc<dyn Sink>,
    generation: u64,
}

/// Owns the sink session. Sessions are built lazily, schema-checked and
/// shared; rebuilding is serialized through the session lock and a
/// generation counter so concurrent callers reuse a fresh session instead of
/// rebuilding it again.
pub struct DeliveryClient {
    connector: Arc<dyn SinkConnector>,
    policy: RetryPolicy,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
}

impl DeliveryClient {
    pub fn new(connector: Arc<dyn SinkConnector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delivers one record, retrying up to the policy's attempt limit.
    pub async fn send(&self, record: &TelemetryRecord) -> Result<Ack, DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut rebuilt = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (sink, generation) = match self.session().await {
                Ok(session) => session,
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(DeliveryError::exhausted(e, attempt));
                    }
                    self.back_off(record, attempt, &e).await;
                    continue;
                }
            };

            match apply(sink.as_ref(), record).await {
                Ok(kind) => {
                    debug!(kind = record.label(), ack = ?kind, attempts = attempt, "Record delivered.");
                    return Ok(Ack {
                        kind,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        warn!(
                            kind = record.label(),
                            attempts = attempt,
                            class = e.class(),
                            error = %e,
                            "Delivery retries exhausted."
                        );
                        return Err(DeliveryError::exhausted(e, attempt));
                    }
                    match e {
                        SinkError::Auth(_) if !rebuilt => {
                            rebuilt = true;
                            info!(error = %e, "Sink rejected credentials; rebuilding session.");
                            self.invalidate(generation).await;
                        }
                        SinkError::Transport(_) => {
                            self.invalidate(generation).await;
                            self.back_off(record, attempt, &e).await;
                        }
                        _ => self.back_off(record, attempt, &e).await,
                    }
                }
            }
        }
    }

    async fn back_off(&self, record: &TelemetryRecord, attempt: u32, error: &SinkError) {
        let delay = self.policy.delay_for(attempt - 1, error);
        warn!(
            kind = record.label(),
            attempt,
            class = error.class(),
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Delivery attempt failed; backing off."
        );
        tokio::time::sleep(delay).await;
    }

    async fn session(&self) -> Result<(Arc<dyn Sink>, u64), SinkError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok((session.sink.clone(), session.generation));
        }
        let sink = self.connector.connect().await?;
        sink.ensure_schema().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Sink session established.");
        *guard = Some(Session {
            sink: sink.clone(),
            generation,
        });
        Ok((sink, generation))
    }

    /// Drops the cached session if it is still the one that failed.
    async fn invalidate(&self, stale_generation: u64) {
        let mut guard = self.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|s| s.generation == stale_generation)
        {
            *guard = None;
        }
    }
}

async fn apply(sink: &dyn Sink, record: &TelemetryRecord) -> Result<AckKind, SinkError> {
    match record {
        TelemetryRecord::Check(check) => {
            sink.append_row(Table::ConnectivityChecks, check_row(check))
                .await?;
            Ok(AckKind::Appended)
        }
        TelemetryRecord::StatusChange(StatusChangeEvent::OutageStart {
            timestamp,
            location_id,
        }) => {
            let exists = sink
                .find_and_update_row(Table::Outages, &outage_match(location_id, timestamp), &[])
                .await?;
            if exists {
                return Ok(AckKind::AlreadyPresent);
            }
            sink.append_row(Table::Outages, outage_start_row(location_id, timestamp))
                .await?;
            Ok(AckKind::Appended)
        }
        TelemetryRecord::StatusChange(StatusChangeEvent::OutageEnd {
            timestamp,
            location_id,
            outage_start,
            duration_seconds,
        }) => {
            let updated = sink
                .find_and_update_row(
                    Table::Outages,
                    &open_outage_match(location_id, outage_start),
                    &outage_resolution(timestamp, *duration_seconds),
                )
                .await?;
            if updated {
                return Ok(AckKind::Updated);
            }
            let exists = sink
                .find_and_update_row(Table::Outages, &outage_match(location_id, outage_start), &[])
                .await?;
            if exists {
                return Ok(AckKind::AlreadyPresent);
            }
            sink.append_row(
                Table::Outages,
                complete_outage_row(location_id, outage_start, timestamp, *duration_seconds),
            )
            .await?;
            Ok(AckKind::InsertedComplete)
        }
    }
}
