//! Typed records that flow from the probe engine to the buffer and the sink.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::probe_engine::aggregate_verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// ICMP-style reachability of a host.
    Reach,
    /// Application-layer HTTP(S) fetch.
    Web,
    /// Name resolution through a specific DNS server.
    Dns,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Reach => "reach",
            ProbeKind::Web => "web",
            ProbeKind::Dns => "dns",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub kind: ProbeKind,
    pub target: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "timeout_used_secs", with = "duration_secs")]
    pub timeout_used: Duration,
}

impl ProbeOutcome {
    pub fn success(
        kind: ProbeKind,
        target: impl Into<String>,
        latency_ms: Option<f64>,
        timeout_used: Duration,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            succeeded: true,
            latency_ms: latency_ms.map(|ms| ms.max(0.0)),
            error: None,
            timeout_used,
        }
    }

    pub fn failure(
        kind: ProbeKind,
        target: impl Into<String>,
        error: impl Into<String>,
        timeout_used: Duration,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            succeeded: false,
            latency_ms: None,
            error: Some(error.into()),
            timeout_used,
        }
    }
}

/// Outage transitions emitted by the outage tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusChangeEvent {
    OutageStart {
        timestamp: DateTime<Utc>,
        location_id: String,
    },
    OutageEnd {
        timestamp: DateTime<Utc>,
        location_id: String,
        outage_start: DateTime<Utc>,
        duration_seconds: f64,
    },
}

impl StatusChangeEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StatusChangeEvent::OutageStart { timestamp, .. }
            | StatusChangeEvent::OutageEnd { timestamp, .. } => *timestamp,
        }
    }

    pub fn location_id(&self) -> &str {
        match self {
            StatusChangeEvent::OutageStart { location_id, .. }
            | StatusChangeEvent::OutageEnd { location_id, .. } => location_id,
        }
    }

    pub fn is_outage_start(&self) -> bool {
        matches!(self, StatusChangeEvent::OutageStart { .. })
    }
}

/// One check cycle. `connected` is always derived from the probe outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub timestamp: DateTime<Utc>,
    pub location_id: String,
    connected: bool,
    probe_outcomes: Vec<ProbeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_change: Option<StatusChangeEvent>,
}

impl CheckResult {
    pub fn new(
        timestamp: DateTime<Utc>,
        location_id: impl Into<String>,
        probe_outcomes: Vec<ProbeOutcome>,
    ) -> Self {
        Self {
            timestamp,
            location_id: location_id.into(),
            connected: aggregate_verdict(&probe_outcomes),
            probe_outcomes,
            status_change: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn probe_outcomes(&self) -> &[ProbeOutcome] {
        &self.probe_outcomes
    }

    pub fn status_change(&self) -> Option<&StatusChangeEvent> {
        self.status_change.as_ref()
    }

    pub fn attach_status_change(&mut self, event: StatusChangeEvent) {
        self.status_change = Some(event);
    }

    pub fn outcomes_of(&self, kind: ProbeKind) -> impl Iterator<Item = &ProbeOutcome> {
        self.probe_outcomes.iter().filter(move |o| o.kind == kind)
    }

    pub fn any_succeeded(&self, kind: ProbeKind) -> bool {
        self.outcomes_of(kind).any(|o| o.succeeded)
    }

    /// Mean latency of the successful probes of `kind` that reported one.
    pub fn mean_latency_ms(&self, kind: ProbeKind) -> Option<f64> {
        let samples: Vec<f64> = self
            .outcomes_of(kind)
            .filter(|o| o.succeeded)
            .filter_map(|o| o.latency_ms)
            .collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        }
    }

    pub fn failed_targets(&self, kind: ProbeKind) -> Vec<&str> {
        self.outcomes_of(kind)
            .filter(|o| !o.succeeded)
            .map(|o| o.target.as_str())
            .collect()
    }
}

/// The unit of buffering and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Check(CheckResult),
    StatusChange(StatusChangeEvent),
}

impl TelemetryRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::Check(check) => check.timestamp,
            TelemetryRecord::StatusChange(event) => event.timestamp(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TelemetryRecord::Check(_) => "connectivity_check",
            TelemetryRecord::StatusChange(StatusChangeEvent::OutageStart { .. }) => "outage_start",
            TelemetryRecord::StatusChange(StatusChangeEvent::OutageEnd { .. }) => "outage_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_attempts: u32,
    pub record: TelemetryRecord,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn outcome(kind: ProbeKind, target: &str, ok: bool, latency: Option<f64>) -> ProbeOutcome {
        if ok {
            ProbeOutcome::success(kind, target, latency, Duration::from_secs(5))
        } else {
            ProbeOutcome::failure(kind, target, "boom", Duration::from_secs(5))
        }
    }

    #[test]
    fn test_connected_is_derived_from_outcomes() {
        let up = CheckResult::new(
            ts(),
            "house1",
            vec![
                outcome(ProbeKind::Reach, "8.8.8.8", true, Some(10.0)),
                outcome(ProbeKind::Web, "https://google.com", false, None),
                outcome(ProbeKind::Dns, "1.1.1.1", true, Some(3.0)),
            ],
        );
        assert!(up.connected());

        let down = CheckResult::new(
            ts(),
            "house1",
            vec![
                outcome(ProbeKind::Reach, "8.8.8.8", true, Some(10.0)),
                outcome(ProbeKind::Web, "https://google.com", false, None),
                outcome(ProbeKind::Dns, "1.1.1.1", false, None),
            ],
        );
        assert!(!down.connected());
    }

    #[test]
    fn test_mean_latency_ignores_failures_and_missing_values() {
        let check = CheckResult::new(
            ts(),
            "house1",
            vec![
                outcome(ProbeKind::Reach, "a", true, Some(10.0)),
                outcome(ProbeKind::Reach, "b", true, None),
                outcome(ProbeKind::Reach, "c", true, Some(20.0)),
                outcome(ProbeKind::Reach, "d", false, None),
            ],
        );
        assert_eq!(check.mean_latency_ms(ProbeKind::Reach), Some(15.0));
        assert_eq!(check.mean_latency_ms(ProbeKind::Web), None);
        assert_eq!(check.failed_targets(ProbeKind::Reach), vec!["d"]);
    }

    #[test]
    fn test_negative_latency_is_clamped() {
        let o = ProbeOutcome::success(ProbeKind::Web, "x", Some(-3.0), Duration::from_secs(1));
        assert_eq!(o.latency_ms, Some(0.0));
    }

    #[test]
    fn test_persisted_check_shape() {
        let mut check = CheckResult::new(
            ts(),
            "house1",
            vec![outcome(ProbeKind::Reach, "8.8.8.8", false, None)],
        );
        check.attach_status_change(StatusChangeEvent::OutageStart {
            timestamp: ts(),
            location_id: "house1".into(),
        });
        let value = serde_json::to_value(&check).unwrap();
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(value["location_id"], "house1");
        assert_eq!(value["connected"], false);
        assert_eq!(value["probe_outcomes"][0]["kind"], "reach");
        assert_eq!(value["probe_outcomes"][0]["timeout_used_secs"], 5.0);
        assert_eq!(value["status_change"]["type"], "outage_start");

        let back: CheckResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, check);
    }
}
