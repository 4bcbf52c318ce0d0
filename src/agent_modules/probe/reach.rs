//! Reachability probes: in-process ICMP echo or the system `ping` command.
use async_trait::async_trait;
use rand::random;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};
use tracing::debug;

use super::{Probe, ProbeError};
use crate::agent_modules::models::ProbeKind;

const ECHO_PAYLOAD: [u8; 56] = [0; 56];

/// ICMP echo through raw or datagram sockets. Needs `CAP_NET_RAW` or an
/// unprivileged ICMP socket range on Linux.
pub struct IcmpProbe {
    client_v4: Client,
    client_v6: Option<Client>,
}

impl IcmpProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client_v4 = Client::new(&Config::default())?;
        let client_v6 = match Client::new(&Config::builder().kind(ICMP::V6).build()) {
            Ok(client) => Some(client),
            Err(e) => {
                debug!(error = %e, "IPv6 ICMP socket unavailable; IPv6 reach targets will fail.");
                None
            }
        };
        Ok(Self {
            client_v4,
            client_v6,
        })
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Reach
    }

    async fn probe(&self, target: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        let addr = resolve_host(target).await?;
        let client = match addr {
            IpAddr::V4(_) => &self.client_v4,
            IpAddr::V6(_) => self
                .client_v6
                .as_ref()
                .ok_or_else(|| ProbeError::Unreachable("no IPv6 ICMP socket".to_string()))?,
        };

        let mut pinger = client.pinger(addr, PingIdentifier(random())).await;
        pinger.timeout(timeout);
        match pinger.ping(PingSequence(0), &ECHO_PAYLOAD).await {
            Ok((_reply, rtt)) => Ok(Some(rtt.as_secs_f64() * 1000.0)),
            Err(SurgeError::Timeout { .. }) => Err(ProbeError::Timeout(timeout)),
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}

async fn resolve_host(target: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(addr) = target.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host(format!("{target}:0"))
        .await
        .map_err(|e| ProbeError::Resolve(format!("{target}: {e}")))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolve(format!("{target}: no addresses")))
}

/// Runs the operating system's `ping` once per target.
#[derive(Debug, Default, Clone)]
pub struct CommandPingProbe;

impl CommandPingProbe {
    pub fn new() -> Self {
        Self
    }

    fn args(target: &str, timeout: Duration) -> Vec<String> {
        let secs = timeout.as_secs().max(1);
        if cfg!(windows) {
            vec![
                "-n".into(),
                "1".into(),
                "-w".into(),
                (secs * 1000).to_string(),
                target.into(),
            ]
        } else {
            vec![
                "-c".into(),
                "1".into(),
                "-W".into(),
                secs.to_string(),
                target.into(),
            ]
        }
    }
}

#[async_trait]
impl Probe for CommandPingProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Reach
    }

    async fn probe(&self, target: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        let output = tokio::process::Command::new("ping")
            .args(Self::args(target, timeout))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(parse_ping_latency(&stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.trim();
            Err(ProbeError::Command(if reason.is_empty() {
                format!("no reply from {target}")
            } else {
                reason.to_string()
            }))
        }
    }
}

/// Extracts the round-trip time in milliseconds from `ping` output.
///
/// Understands `time=14.2 ms` (Linux, Windows), `time<1ms` (Windows) and the
/// macOS summary `round-trip min/avg/max/stddev = a/b/c/d ms`, where the
/// average is used.
pub fn parse_ping_latency(output: &str) -> Option<f64> {
    let lower = output.to_lowercase();

    let mut rest = lower.as_str();
    while let Some(pos) = rest.find("time") {
        let after = &rest[pos + "time".len()..];
        let trimmed = after.trim_start_matches(['=', '<', '>']);
        if trimmed.len() < after.len() {
            let number: String = trimmed
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(value) = number.parse::<f64>() {
                return Some(value);
            }
        }
        rest = after;
    }

    let summary = lower.find("round-trip").or_else(|| lower.find("rtt min"))?;
    let stats = lower[summary..].split_once('=')?.1;
    stats
        .trim()
        .split('/')
        .nth(1)
        .and_then(|avg| avg.trim().parse::<f64>().ok())
}
