//! Mapping of records onto the sink's table layout.
use chrono::{DateTime, Utc};

use super::{Cell, CellUpdate, Row, RowMatch, STATUS_ONGOING, STATUS_RESOLVED};
use crate::agent_modules::models::{CheckResult, ProbeKind};
use crate::agent_modules::utils::{format_timestamp, round2};

pub fn check_row(check: &CheckResult) -> Row {
    vec![
        Cell::text(format_timestamp(&check.timestamp)),
        Cell::text(check.location_id.clone()),
        Cell::Bool(check.connected()),
        Cell::Bool(check.any_succeeded(ProbeKind::Reach)),
        Cell::Bool(check.any_succeeded(ProbeKind::Web)),
        Cell::Bool(check.any_succeeded(ProbeKind::Dns)),
        Cell::Number(
            check
                .mean_latency_ms(ProbeKind::Reach)
                .map(round2)
                .unwrap_or(0.0),
        ),
        Cell::text(check_notes(check)),
    ]
}

/// Human readable failure summary, e.g. `Ping failed: 8.8.8.8; DNS failed: 1.1.1.1`.
pub fn check_notes(check: &CheckResult) -> String {
    let notes: Vec<String> = [
        (ProbeKind::Reach, "Ping"),
        (ProbeKind::Web, "HTTP"),
        (ProbeKind::Dns, "DNS"),
    ]
    .into_iter()
    .filter_map(|(kind, label)| {
        let failed = check.failed_targets(kind);
        (!failed.is_empty()).then(|| format!("{label} failed: {}", failed.join(", ")))
    })
    .collect();

    if notes.is_empty() {
        "All tests passed".to_string()
    } else {
        notes.join("; ")
    }
}

pub fn outage_start_row(location_id: &str, start: &DateTime<Utc>) -> Row {
    vec![
        Cell::text(location_id),
        Cell::text(format_timestamp(start)),
        Cell::empty(),
        Cell::empty(),
        Cell::empty(),
        Cell::empty(),
        Cell::text(STATUS_ONGOING),
    ]
}

pub fn complete_outage_row(
    location_id: &str,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    duration_seconds: f64,
) -> Row {
    let mut row = vec![Cell::text(location_id), Cell::text(format_timestamp(start))];
    row.extend(outage_resolution(end, duration_seconds).into_iter().map(|u| u.value));
    row
}

/// Cells written when an outage closes: end time, durations and status.
pub fn outage_resolution(end: &DateTime<Utc>, duration_seconds: f64) -> Vec<CellUpdate> {
    vec![
        CellUpdate::new("End_Time", Cell::text(format_timestamp(end))),
        CellUpdate::new("Duration_Seconds", Cell::Number(duration_seconds)),
        CellUpdate::new("Duration_Minutes", Cell::Number(round2(duration_seconds / 60.0))),
        CellUpdate::new("Duration_Hours", Cell::Number(round2(duration_seconds / 3600.0))),
        CellUpdate::new("Status", Cell::text(STATUS_RESOLVED)),
    ]
}

/// Any outage row for (location, start), whatever its status.
pub fn outage_match(location_id: &str, start: &DateTime<Utc>) -> RowMatch {
    RowMatch::new()
        .with("Location_ID", Cell::text(location_id))
        .with("Start_Time", Cell::text(format_timestamp(start)))
}

/// The still-open outage row for (location, start).
pub fn open_outage_match(location_id: &str, start: &DateTime<Utc>) -> RowMatch {
    outage_match(location_id, start).with("Status", Cell::text(STATUS_ONGOING))
}
