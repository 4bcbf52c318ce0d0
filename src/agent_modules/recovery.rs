//! Replays the buffered backlog after connectivity returns.
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::buffer::{self, AttemptOutcome, SharedBuffer};
use super::delivery::DeliveryClient;
use super::models::{StatusChangeEvent, TelemetryRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub connectivity_checks: usize,
    pub outages_started: usize,
    pub outages_completed: usize,
    pub errors: usize,
    /// Records given up on during this pass.
    pub dropped: usize,
    pub remaining: usize,
    /// The pass stopped at a failed record before reaching the end.
    pub interrupted: bool,
}

impl RecoveryReport {
    pub fn delivered(&self) -> usize {
        self.connectivity_checks + self.outages_started + self.outages_completed
    }
}

pub struct RecoveryCoordinator {
    cooldown: Duration,
    pacing: Duration,
    max_record_attempts: u32,
    last_started: Option<Instant>,
}

impl RecoveryCoordinator {
    pub fn new(cooldown: Duration, pacing: Duration, max_record_attempts: u32) -> Self {
        Self {
            cooldown,
            pacing,
            max_record_attempts,
            last_started: None,
        }
    }

    /// Claims the recovery slot. Succeeds at most once per cooldown window.
    pub fn try_begin(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_started
            && now.duration_since(last) < self.cooldown
        {
            info!(
                cooldown_remaining_secs = (self.cooldown - now.duration_since(last)).as_secs(),
                "Recovery skipped; still in cooldown."
            );
            return false;
        }
        self.last_started = Some(now);
        true
    }

    /// Delivers the backlog oldest first. A failed record keeps its place and
    /// ends the pass, so later records never overtake it.
    pub async fn drain(&self, buffer: &SharedBuffer, client: &DeliveryClient) -> RecoveryReport {
        let backlog = buffer::lock(buffer).list_unconfirmed();
        let mut report = RecoveryReport::default();
        if backlog.is_empty() {
            return report;
        }
        info!(records = backlog.len(), "Draining buffered records.");

        for (i, entry) in backlog.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            match client.send(&entry.record).await {
                Ok(_) => {
                    match &entry.record {
                        TelemetryRecord::Check(_) => report.connectivity_checks += 1,
                        TelemetryRecord::StatusChange(StatusChangeEvent::OutageStart { .. }) => {
                            report.outages_started += 1
                        }
                        TelemetryRecord::StatusChange(StatusChangeEvent::OutageEnd { .. }) => {
                            report.outages_completed += 1
                        }
                    }
                    if let Err(e) = buffer::lock(buffer).mark_delivered(entry.id) {
                        error!(id = %entry.id, error = %e, "Failed to remove delivered record from buffer.");
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    report.interrupted = i + 1 < backlog.len();
                    warn!(id = %entry.id, kind = entry.record.label(), error = %e, "Recovery pass stopped at failed record.");
                    let outcome =
                        buffer::lock(buffer).record_failed_attempt(entry.id, self.max_record_attempts);
                    match outcome {
                        Ok(AttemptOutcome::Dropped { .. }) => report.dropped += 1,
                        Ok(_) => {}
                        Err(e) => error!(id = %entry.id, error = %e, "Failed to persist delivery attempt."),
                    }
                    break;
                }
            }
        }

        report.remaining = buffer::lock(buffer).len();
        info!(
            checks = report.connectivity_checks,
            outages_started = report.outages_started,
            outages_completed = report.outages_completed,
            errors = report.errors,
            remaining = report.remaining,
            "Recovery pass finished."
        );
        report
    }
}
