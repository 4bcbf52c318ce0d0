//! Single connectivity probes.
//!
//! A [`Probe`] runs one test of one [`ProbeKind`] against one target. Failures
//! are values: every error ends up in a [`ProbeOutcome`](super::models::ProbeOutcome)
//! and never escapes the probe engine.
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::models::ProbeKind;

pub mod dns;
pub mod reach;
pub mod web;

pub use dns::DnsProbe;
pub use reach::{CommandPingProbe, IcmpProbe, parse_ping_latency};
pub use web::WebProbe;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("DNS resolution failed: {0}")]
    Resolve(String),
    #[error("ping failed: {0}")]
    Command(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("probe task panicked")]
    Panicked,
}

/// One kind of connectivity test.
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Tests `target`, giving up after `timeout`.
    ///
    /// Returns the measured latency in milliseconds when the probe can report
    /// one; the engine falls back to wall-clock time otherwise.
    async fn probe(&self, target: &str, timeout: Duration) -> Result<Option<f64>, ProbeError>;
}
