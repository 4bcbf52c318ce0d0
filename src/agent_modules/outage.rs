//! Outage detection: turns a stream of verdicts into outage start/end events.
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};

use super::models::StatusChangeEvent;
use super::utils::write_atomically;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unknown,
    Up,
    Down,
}

/// Persisted tracker state. `open_outage_start` is set iff the last
/// transition was Up -> Down and its OutageEnd has not been produced.
/// `down_is_baseline` marks a Down that was the very first observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutageState {
    pub last_verdict: Option<bool>,
    pub open_outage_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub down_is_baseline: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsistencyError {
    #[error("outage at {location_id} would end at {end} before it started at {start}")]
    NegativeDuration {
        location_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("outage at {location_id} ended at {end} but no outage was open")]
    OrphanedOutageEnd {
        location_id: String,
        end: DateTime<Utc>,
    },
    #[error("restored state for {location_id} has an open outage from {start} while the link was up")]
    OpenOutageWhileUp {
        location_id: String,
        start: DateTime<Utc>,
    },
}

pub struct OutageTracker {
    location_id: String,
    state: OutageState,
}

impl OutageTracker {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            state: OutageState::default(),
        }
    }

    /// Resumes from a persisted state. An open outage paired with a
    /// non-down verdict cannot be produced by [`observe`](Self::observe) and
    /// is rejected.
    pub fn restore(
        location_id: impl Into<String>,
        state: OutageState,
    ) -> Result<Self, ConsistencyError> {
        let location_id = location_id.into();
        if let Some(start) = state.open_outage_start
            && state.last_verdict != Some(false)
        {
            return Err(ConsistencyError::OpenOutageWhileUp { location_id, start });
        }
        Ok(Self { location_id, state })
    }

    /// Loads state from `path`. Anything unreadable starts a fresh tracker.
    pub fn load(location_id: &str, path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(location_id),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read outage state; starting fresh.");
                return Self::new(location_id);
            }
        };
        let state: OutageState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = ?path, error = %e, "Outage state is corrupt; starting fresh.");
                return Self::new(location_id);
            }
        };
        match Self::restore(location_id, state) {
            Ok(tracker) => {
                info!(
                    location_id = %location_id,
                    last_verdict = ?tracker.state.last_verdict,
                    open_outage_start = ?tracker.state.open_outage_start,
                    "Restored outage state."
                );
                tracker
            }
            Err(e) => {
                error!(error = %e, "Discarding inconsistent outage state.");
                Self::new(location_id)
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomically(path, &bytes)
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    pub fn state(&self) -> &OutageState {
        &self.state
    }

    pub fn link_state(&self) -> LinkState {
        match self.state.last_verdict {
            None => LinkState::Unknown,
            Some(true) => LinkState::Up,
            Some(false) => LinkState::Down,
        }
    }

    /// Feeds one verdict observed at `at`.
    ///
    /// A Down -> Up transition whose Down was the baseline observation has no
    /// start to close and emits nothing. Any other Down -> Up without an open
    /// outage is an orphaned end.
    pub fn observe(
        &mut self,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<StatusChangeEvent>, ConsistencyError> {
        let previous = self.state.last_verdict.replace(connected);
        match (previous, connected) {
            (None, _) => {
                self.state.down_is_baseline = !connected;
                info!(location_id = %self.location_id, connected, "First connectivity observation.");
                Ok(None)
            }
            (Some(true), false) => {
                self.state.open_outage_start = Some(at);
                self.state.down_is_baseline = false;
                warn!(location_id = %self.location_id, at = %at, "Internet outage detected.");
                Ok(Some(StatusChangeEvent::OutageStart {
                    timestamp: at,
                    location_id: self.location_id.clone(),
                }))
            }
            (Some(false), true) => {
                let baseline = std::mem::take(&mut self.state.down_is_baseline);
                let Some(start) = self.state.open_outage_start.take() else {
                    if baseline {
                        info!(location_id = %self.location_id, "Connectivity established.");
                        return Ok(None);
                    }
                    error!(
                        location_id = %self.location_id,
                        end = %at,
                        "Link came back up without an open outage."
                    );
                    return Err(ConsistencyError::OrphanedOutageEnd {
                        location_id: self.location_id.clone(),
                        end: at,
                    });
                };
                let elapsed = at - start;
                if elapsed < TimeDelta::zero() {
                    error!(
                        location_id = %self.location_id,
                        start = %start,
                        end = %at,
                        "Outage would end before it started; refusing to record a negative duration."
                    );
                    return Err(ConsistencyError::NegativeDuration {
                        location_id: self.location_id.clone(),
                        start,
                        end: at,
                    });
                }
                let duration_seconds = seconds(elapsed);
                info!(
                    location_id = %self.location_id,
                    duration_minutes = %format!("{:.1}", duration_seconds / 60.0),
                    "Internet restored."
                );
                Ok(Some(StatusChangeEvent::OutageEnd {
                    timestamp: at,
                    location_id: self.location_id.clone(),
                    outage_start: start,
                    duration_seconds,
                }))
            }
            (Some(true), true) | (Some(false), false) => Ok(None),
        }
    }
}

fn seconds(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_seconds() as f64,
    }
}
