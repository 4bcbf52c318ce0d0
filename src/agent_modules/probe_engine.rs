//! Runs one check cycle worth of probes and folds them into a verdict.
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::config::{MonitorConfig, ReachMethod};
use super::models::{CheckResult, ProbeKind, ProbeOutcome};
use super::probe::{CommandPingProbe, DnsProbe, IcmpProbe, Probe, ProbeError, WebProbe};

/// Slack on top of a probe's own timeout before the engine gives up on it.
/// Covers process start-up for command based probes.
pub const PROBE_GRACE: Duration = Duration::from_secs(2);

/// `connected = any(reach) AND (any(web) OR any(dns))`.
///
/// Reachability alone is not enough: ICMP can pass while the application
/// path is blocked.
pub fn aggregate_verdict(outcomes: &[ProbeOutcome]) -> bool {
    let any = |kind: ProbeKind| outcomes.iter().any(|o| o.kind == kind && o.succeeded);
    any(ProbeKind::Reach) && (any(ProbeKind::Web) || any(ProbeKind::Dns))
}

struct ProbePlan {
    probe: Arc<dyn Probe>,
    targets: Vec<String>,
    timeout: Duration,
}

pub struct ProbeEngine {
    location_id: String,
    plans: Vec<ProbePlan>,
    grace: Duration,
}

impl ProbeEngine {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            plans: Vec::new(),
            grace: PROBE_GRACE,
        }
    }

    /// Adds a probe run against every target in order. Plans run in the
    /// order they are added.
    pub fn with_probe(
        mut self,
        probe: Arc<dyn Probe>,
        targets: Vec<String>,
        timeout: Duration,
    ) -> Self {
        self.plans.push(ProbePlan {
            probe,
            targets,
            timeout,
        });
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Builds the production probe set: reach, then web, then DNS.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, ProbeError> {
        let reach: Arc<dyn Probe> = match config.reach_method {
            ReachMethod::Icmp => Arc::new(IcmpProbe::new()?),
            ReachMethod::Command => Arc::new(CommandPingProbe::new()),
        };
        Ok(Self::new(config.location_id.clone())
            .with_probe(reach, config.reach_targets.clone(), config.reach_timeout)
            .with_probe(
                Arc::new(WebProbe::new()?),
                config.web_targets.clone(),
                config.web_timeout,
            )
            .with_probe(
                Arc::new(DnsProbe::new(config.dns_query_domain.clone())),
                config.dns_servers.clone(),
                config.dns_timeout,
            ))
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    /// Upper bound on how long the probe phase of a cycle may take.
    pub fn cycle_bound(&self) -> Duration {
        self.plans
            .iter()
            .map(|p| p.timeout)
            .max()
            .unwrap_or_default()
            + self.grace
    }

    /// Runs every probe concurrently. Each one is isolated in its own task
    /// with its own timeout, so a failing, hanging or panicking probe only
    /// affects its own outcome.
    pub async fn run_cycle(&self) -> CheckResult {
        let timestamp = Utc::now();

        let mut pending = Vec::new();
        for plan in &self.plans {
            let kind = plan.probe.kind();
            for target in &plan.targets {
                let probe = Arc::clone(&plan.probe);
                let target = target.clone();
                let timeout = plan.timeout;
                let limit = timeout + self.grace;
                let handle = tokio::spawn({
                    let target = target.clone();
                    async move { run_probe(probe, target, timeout, limit).await }
                });
                pending.push((kind, target, timeout, handle));
            }
        }

        let handles = pending.iter_mut().map(|(_, _, _, handle)| handle);
        let joined = futures::future::join_all(handles).await;

        let outcomes: Vec<ProbeOutcome> = pending
            .iter()
            .zip(joined)
            .map(|((kind, target, timeout, _), joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(kind = %kind, target = %target, error = %e, "Probe task failed.");
                    ProbeOutcome::failure(*kind, target.clone(), ProbeError::Panicked.to_string(), *timeout)
                }
            })
            .collect();

        let result = CheckResult::new(timestamp, self.location_id.clone(), outcomes);
        debug!(
            connected = result.connected(),
            probes = result.probe_outcomes().len(),
            "Probe cycle finished."
        );
        result
    }
}

async fn run_probe(
    probe: Arc<dyn Probe>,
    target: String,
    timeout: Duration,
    limit: Duration,
) -> ProbeOutcome {
    let kind = probe.kind();
    let start_time = Instant::now();
    match tokio::time::timeout(limit, probe.probe(&target, timeout)).await {
        Ok(Ok(latency)) => {
            let latency =
                latency.or_else(|| Some(start_time.elapsed().as_secs_f64() * 1000.0));
            ProbeOutcome::success(kind, target, latency, timeout)
        }
        Ok(Err(e)) => {
            debug!(kind = %kind, target = %target, error = %e, "Probe failed.");
            ProbeOutcome::failure(kind, target, e.to_string(), timeout)
        }
        Err(_) => {
            debug!(kind = %kind, target = %target, "Probe exceeded its time limit.");
            ProbeOutcome::failure(kind, target, ProbeError::Timeout(timeout).to_string(), timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    enum Behavior {
        Ok(f64),
        Fail,
        Hang,
        Panic,
    }

    struct ScriptedProbe {
        kind: ProbeKind,
        behavior: HashMap<String, Behavior>,
    }

    impl ScriptedProbe {
        fn new(kind: ProbeKind, script: Vec<(&str, Behavior)>) -> Arc<dyn Probe> {
            Arc::new(Self {
                kind,
                behavior: script.into_iter().map(|(t, b)| (t.to_string(), b)).collect(),
            })
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn kind(&self) -> ProbeKind {
            self.kind
        }

        async fn probe(&self, target: &str, _timeout: Duration) -> Result<Option<f64>, ProbeError> {
            match self.behavior.get(target) {
                Some(Behavior::Ok(ms)) => Ok(Some(*ms)),
                Some(Behavior::Fail) | None => Err(ProbeError::Unreachable(target.to_string())),
                Some(Behavior::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Behavior::Panic) => panic!("scripted panic"),
            }
        }
    }

    fn outcome(kind: ProbeKind, ok: bool) -> ProbeOutcome {
        if ok {
            ProbeOutcome::success(kind, "t", Some(1.0), Duration::from_secs(1))
        } else {
            ProbeOutcome::failure(kind, "t", "x", Duration::from_secs(1))
        }
    }

    #[test]
    fn test_verdict_truth_table() {
        for reach in [false, true] {
            for web in [false, true] {
                for dns in [false, true] {
                    let outcomes = vec![
                        outcome(ProbeKind::Reach, reach),
                        outcome(ProbeKind::Web, web),
                        outcome(ProbeKind::Dns, dns),
                    ];
                    assert_eq!(aggregate_verdict(&outcomes), reach && (web || dns));
                }
            }
        }
    }

    #[test]
    fn test_reach_alone_is_not_connected() {
        assert!(!aggregate_verdict(&[outcome(ProbeKind::Reach, true)]));
        assert!(!aggregate_verdict(&[]));
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let engine = ProbeEngine::new("house1")
            .with_probe(
                ScriptedProbe::new(
                    ProbeKind::Reach,
                    vec![("a", Behavior::Fail), ("b", Behavior::Ok(12.0))],
                ),
                vec!["a".into(), "b".into()],
                Duration::from_secs(1),
            )
            .with_probe(
                ScriptedProbe::new(ProbeKind::Web, vec![("w", Behavior::Panic)]),
                vec!["w".into()],
                Duration::from_secs(1),
            )
            .with_probe(
                ScriptedProbe::new(ProbeKind::Dns, vec![("d", Behavior::Ok(3.0))]),
                vec!["d".into()],
                Duration::from_secs(1),
            );

        let result = engine.run_cycle().await;
        let targets: Vec<&str> = result
            .probe_outcomes()
            .iter()
            .map(|o| o.target.as_str())
            .collect();
        assert_eq!(targets, vec!["a", "b", "w", "d"]);
        assert!(!result.probe_outcomes()[0].succeeded);
        assert_eq!(result.probe_outcomes()[1].latency_ms, Some(12.0));
        assert_eq!(
            result.probe_outcomes()[2].error.as_deref(),
            Some("probe task panicked")
        );
        assert!(result.connected());
        assert_eq!(result.location_id, "house1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out_without_latency() {
        let engine = ProbeEngine::new("house1")
            .with_probe(
                ScriptedProbe::new(ProbeKind::Reach, vec![("slow", Behavior::Hang)]),
                vec!["slow".into()],
                Duration::from_secs(3),
            )
            .with_probe(
                ScriptedProbe::new(ProbeKind::Web, vec![("w", Behavior::Ok(5.0))]),
                vec!["w".into()],
                Duration::from_secs(1),
            );
        assert_eq!(engine.cycle_bound(), Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let result = engine.run_cycle().await;
        assert!(started.elapsed() <= engine.cycle_bound());

        let slow = &result.probe_outcomes()[0];
        assert!(!slow.succeeded);
        assert_eq!(slow.latency_ms, None);
        assert_eq!(slow.error.as_deref(), Some("timeout after 3s"));
        assert_eq!(slow.timeout_used, Duration::from_secs(3));
        assert!(!result.connected());
    }
}
