//! The remote system of record for telemetry.
//!
//! The pipeline only relies on the three operations of [`Sink`], each with
//! at-least-once semantics and a classified [`SinkError`]. Sessions are
//! produced by a [`SinkConnector`] so they can be rebuilt after an
//! authentication failure.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
mod rows;

pub use http::{HttpSink, HttpSinkConnector, SinkSettings};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemorySink, SinkCall, SinkOp};
pub use rows::{
    check_notes, check_row, complete_outage_row, open_outage_match, outage_match,
    outage_resolution, outage_start_row,
};

pub const CHECK_COLUMNS: [&str; 8] = [
    "Timestamp",
    "Location_ID",
    "Connected",
    "Ping_Success",
    "HTTP_Success",
    "DNS_Success",
    "Avg_Ping_MS",
    "Notes",
];

pub const OUTAGE_COLUMNS: [&str; 7] = [
    "Location_ID",
    "Start_Time",
    "End_Time",
    "Duration_Seconds",
    "Duration_Minutes",
    "Duration_Hours",
    "Status",
];

pub const STATUS_ONGOING: &str = "ONGOING";
pub const STATUS_RESOLVED: &str = "RESOLVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ConnectivityChecks,
    Outages,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::ConnectivityChecks, Table::Outages];

    pub fn name(&self) -> &'static str {
        match self {
            Table::ConnectivityChecks => "Connectivity_Checks",
            Table::Outages => "Outages",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::ConnectivityChecks => &CHECK_COLUMNS,
            Table::Outages => &OUTAGE_COLUMNS,
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }
}

/// A single spreadsheet-like cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn empty() -> Self {
        Cell::Text(String::new())
    }
}

pub type Row = Vec<Cell>;

/// Column equality criteria selecting rows of a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowMatch {
    criteria: Vec<(&'static str, Cell)>,
}

impl RowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: Cell) -> Self {
        self.criteria.push((column, value));
        self
    }

    pub fn criteria(&self) -> &[(&'static str, Cell)] {
        &self.criteria
    }

    /// Whether `row` of `table` satisfies every criterion. Unknown columns
    /// and short rows never match.
    pub fn matches(&self, table: Table, row: &[Cell]) -> bool {
        self.criteria.iter().all(|(column, expected)| {
            table
                .column_index(column)
                .and_then(|i| row.get(i))
                .is_some_and(|cell| cell == expected)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub column: &'static str,
    pub value: Cell,
}

impl CellUpdate {
    pub fn new(column: &'static str, value: Cell) -> Self {
        Self { column, value }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("sink authentication failed: {0}")]
    Auth(String),
    #[error("sink rate limit hit: {0}")]
    RateLimit(String),
    #[error("sink transport error: {0}")]
    Transport(String),
    #[error("sink error: {0}")]
    Unknown(String),
}

impl SinkError {
    /// Classifies an HTTP status returned by a sink.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = format!("HTTP {status}: {}", detail.into());
        match status {
            401 | 403 => SinkError::Auth(detail),
            429 => SinkError::RateLimit(detail),
            500..=599 => SinkError::Transport(detail),
            _ => SinkError::Unknown(detail),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            SinkError::Auth(_) => "auth",
            SinkError::RateLimit(_) => "rate_limit",
            SinkError::Transport(_) => "transport",
            SinkError::Unknown(_) => "unknown",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SinkError::Auth(m)
            | SinkError::RateLimit(m)
            | SinkError::Transport(m)
            | SinkError::Unknown(m) => m,
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Creates missing tables and header rows. Idempotent.
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    async fn append_row(&self, table: Table, row: Row) -> Result<(), SinkError>;

    /// Applies `updates` to the first row matching `matcher` and reports
    /// whether one matched. With no updates this is an existence check.
    async fn find_and_update_row(
        &self,
        table: Table,
        matcher: &RowMatch,
        updates: &[CellUpdate],
    ) -> Result<bool, SinkError>;
}

#[async_trait]
pub trait SinkConnector: Send + Sync {
    /// Builds a fresh session, re-reading credentials.
    async fn connect(&self) -> Result<Arc<dyn Sink>, SinkError>;
}
