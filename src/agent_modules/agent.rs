//! The check cycle, run loop and shutdown sequence.
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::buffer::{self, AttemptOutcome, BufferError, BufferHealth, DurableBuffer, SharedBuffer};
use super::config::{ConfigError, MonitorConfig};
use super::delivery::DeliveryClient;
use super::models::{ProbeKind, StatusChangeEvent, TelemetryRecord};
use super::outage::{LinkState, OutageTracker};
use super::probe::ProbeError;
use super::probe_engine::ProbeEngine;
use super::recovery::{RecoveryCoordinator, RecoveryReport};
use super::sink::HttpSinkConnector;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up probes: {0}")]
    Probe(#[from] ProbeError),
    #[error("failed to prepare data directory {path:?}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("buffer could not be flushed: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub connected: bool,
    pub status_change: Option<StatusChangeEvent>,
    /// Fresh records delivered live this cycle.
    pub delivered: usize,
    pub failed: usize,
    pub recovery: Option<RecoveryReport>,
    pub buffer_health: BufferHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub final_drain: Option<RecoveryReport>,
    pub drain_timed_out: bool,
    pub buffer_health: BufferHealth,
}

pub struct Agent {
    config: MonitorConfig,
    engine: ProbeEngine,
    tracker: OutageTracker,
    buffer: SharedBuffer,
    delivery: Option<DeliveryClient>,
    recovery: RecoveryCoordinator,
    connected_cycles: u64,
}

impl Agent {
    /// Opens the local state under the configured data directory. `delivery`
    /// is `None` in local-only mode.
    pub fn new(
        config: MonitorConfig,
        engine: ProbeEngine,
        delivery: Option<DeliveryClient>,
    ) -> Result<Self, AgentError> {
        let mut dirs = vec![config.data_dir.clone()];
        if let Some(parent) = config.buffer_path.parent()
            && !parent.as_os_str().is_empty()
        {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|source| AgentError::DataDir { path: dir, source })?;
        }

        let buffer = DurableBuffer::open(&config.buffer_path, config.buffer_capacity);
        info!(
            path = ?config.buffer_path,
            pending = buffer.len(),
            capacity = config.buffer_capacity,
            "Opened local buffer."
        );
        let tracker = OutageTracker::load(&config.location_id, &config.state_path());
        let recovery = RecoveryCoordinator::new(
            config.recovery_cooldown,
            config.recovery_pacing,
            config.max_record_attempts,
        );

        Ok(Self {
            tracker,
            buffer: Arc::new(Mutex::new(buffer)),
            delivery,
            recovery,
            engine,
            config,
            connected_cycles: 0,
        })
    }

    /// Wires the production probes and, when a sink is configured, the HTTP
    /// delivery path.
    pub fn from_config(config: MonitorConfig) -> Result<Self, AgentError> {
        let engine = ProbeEngine::from_config(&config)?;
        let delivery = match &config.sink {
            Some(settings) => {
                info!(endpoint = %settings.endpoint, "Telemetry sink configured.");
                Some(DeliveryClient::new(
                    Arc::new(HttpSinkConnector::new(settings.clone())),
                    config.retry.clone(),
                ))
            }
            None => {
                warn!("No sink configured; running in local-only mode. Records are buffered but never delivered.");
                None
            }
        };
        Self::new(config, engine, delivery)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn link_state(&self) -> LinkState {
        self.tracker.link_state()
    }

    pub fn buffer_health(&self) -> BufferHealth {
        buffer::lock(&self.buffer).health()
    }

    /// Probes once, records the outcome locally and, while connected, pushes
    /// it and any backlog to the sink.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut check = self.engine.run_cycle().await;
        let connected = check.connected();
        let previous = self.tracker.link_state();

        let state_before = self.tracker.state().clone();
        let event = match self.tracker.observe(connected, check.timestamp) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Outage bookkeeping is inconsistent; storing the raw check result.");
                None
            }
        };
        if *self.tracker.state() != state_before
            && let Err(e) = self.tracker.save(&self.config.state_path())
        {
            error!(error = %e, "Failed to persist outage state.");
        }

        let mut fresh = Vec::new();
        if let Some(event) = &event {
            check.attach_status_change(event.clone());
            fresh.extend(self.store(TelemetryRecord::StatusChange(event.clone())));
        }

        info!(
            location_id = %check.location_id,
            connected,
            reach_ok = check.any_succeeded(ProbeKind::Reach),
            web_ok = check.any_succeeded(ProbeKind::Web),
            dns_ok = check.any_succeeded(ProbeKind::Dns),
            avg_ping_ms = ?check.mean_latency_ms(ProbeKind::Reach),
            "Connectivity check complete."
        );
        fresh.extend(self.store(TelemetryRecord::Check(check)));

        let mut report = CycleReport {
            connected,
            status_change: event,
            delivered: 0,
            failed: 0,
            recovery: None,
            buffer_health: BufferHealth::default(),
        };

        if connected && let Some(client) = &self.delivery {
            self.connected_cycles += 1;
            let recovering = previous != LinkState::Up;
            // Records buffered before this cycle; they go out ahead of `fresh`.
            let older = buffer::lock(&self.buffer).len().saturating_sub(fresh.len());

            if (recovering || older > 0) && self.recovery.try_begin() {
                if recovering {
                    info!(previous = ?previous, "Connectivity restored; replaying buffered records.");
                } else {
                    info!(backlog = older, "Replaying the buffered backlog.");
                }
                report.recovery = Some(self.recovery.drain(&self.buffer, client).await);
            } else {
                if older == 0 {
                    let (delivered, failed) = self.deliver_fresh(client, &fresh).await;
                    report.delivered = delivered;
                    report.failed = failed;
                } else {
                    info!(backlog = older, "Holding new records behind the buffered backlog.");
                }

                let sweep = self.config.sweep_every_cycles;
                let backlog = buffer::lock(&self.buffer).len();
                if sweep > 0 && self.connected_cycles % sweep == 0 && backlog > 0 {
                    info!(backlog, "Retrying buffered records.");
                    report.recovery = Some(self.recovery.drain(&self.buffer, client).await);
                }
            }
        }

        report.buffer_health = self.buffer_health();
        if report.buffer_health.is_degraded() {
            warn!(health = ?report.buffer_health, "Local buffer is degraded.");
        }
        report
    }

    fn store(&self, record: TelemetryRecord) -> Option<(Uuid, TelemetryRecord)> {
        let label = record.label();
        match buffer::lock(&self.buffer).append(record.clone()) {
            Ok(id) => Some((id, record)),
            Err(e) => {
                error!(kind = label, error = %e, "Failed to persist record; it stays in memory until the next successful write.");
                None
            }
        }
    }

    /// Sends this cycle's records in order, stopping at the first failure.
    async fn deliver_fresh(
        &self,
        client: &DeliveryClient,
        fresh: &[(Uuid, TelemetryRecord)],
    ) -> (usize, usize) {
        let mut delivered = 0;
        for (id, record) in fresh {
            match client.send(record).await {
                Ok(_) => {
                    delivered += 1;
                    if let Err(e) = buffer::lock(&self.buffer).mark_delivered(*id) {
                        error!(id = %id, error = %e, "Failed to remove delivered record from buffer.");
                    }
                }
                Err(e) => {
                    warn!(kind = record.label(), error = %e, "Live delivery failed; record kept in buffer.");
                    let outcome = buffer::lock(&self.buffer)
                        .record_failed_attempt(*id, self.config.max_record_attempts);
                    match outcome {
                        Ok(AttemptOutcome::Dropped { attempts }) => {
                            warn!(id = %id, attempts, "Record dropped.")
                        }
                        Ok(_) => {}
                        Err(e) => error!(id = %id, error = %e, "Failed to persist delivery attempt."),
                    }
                    return (delivered, 1);
                }
            }
        }
        (delivered, 0)
    }

    /// Runs cycles every `check_interval` until `shutdown` turns true, then
    /// performs the shutdown sequence. A cycle in flight is always finished.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShutdownReport, AgentError> {
        info!(
            location_id = %self.config.location_id,
            interval_secs = self.config.check_interval.as_secs(),
            "Connectivity monitor started."
        );

        while !*shutdown.borrow() {
            let started = Instant::now();
            self.run_cycle().await;

            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep_until(started + self.config.check_interval) => {}
            }
        }

        info!("Shutdown requested.");
        self.shutdown().await
    }

    /// Final best-effort drain, bounded by the shutdown drain timeout, then a
    /// buffer flush. The flush result decides the exit status.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, AgentError> {
        let mut final_drain = None;
        let mut drain_timed_out = false;

        let backlog = buffer::lock(&self.buffer).len();
        if let Some(client) = &self.delivery
            && backlog > 0
        {
            if self.tracker.link_state() == LinkState::Up {
                match tokio::time::timeout(
                    self.config.shutdown_drain_timeout,
                    self.recovery.drain(&self.buffer, client),
                )
                .await
                {
                    Ok(report) => final_drain = Some(report),
                    Err(_) => {
                        drain_timed_out = true;
                        warn!(
                            timeout_secs = self.config.shutdown_drain_timeout.as_secs(),
                            "Final drain timed out; remaining records stay buffered."
                        );
                    }
                }
            } else {
                info!(backlog, "Link is not up; skipping final drain.");
            }
        }

        if let Err(e) = self.tracker.save(&self.config.state_path()) {
            error!(error = %e, "Failed to persist outage state at shutdown.");
        }
        buffer::lock(&self.buffer).flush()?;

        let buffer_health = self.buffer_health();
        info!(remaining = buffer_health.len, "Agent stopped.");
        Ok(ShutdownReport {
            final_drain,
            drain_timed_out,
            buffer_health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_modules::config::AgentFileConfig;
    use crate::agent_modules::delivery::RetryPolicy;
    use crate::agent_modules::probe::Probe;
    use crate::agent_modules::sink::{
        Cell, CellUpdate, MemoryConnector, MemorySink, Row, RowMatch, STATUS_RESOLVED, Sink,
        SinkConnector, SinkError, SinkOp, Table,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SwitchProbe {
        kind: ProbeKind,
        up: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Probe for SwitchProbe {
        fn kind(&self) -> ProbeKind {
            self.kind
        }

        async fn probe(&self, target: &str, _timeout: Duration) -> Result<Option<f64>, ProbeError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(Some(12.5))
            } else {
                Err(ProbeError::Unreachable(target.to_string()))
            }
        }
    }

    struct Harness {
        agent: Agent,
        up: Arc<AtomicBool>,
        connector: Arc<MemoryConnector>,
        _dir: tempfile::TempDir,
    }

    fn setup() -> (MonitorConfig, ProbeEngine, Arc<AtomicBool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = AgentFileConfig::default();
        file.data_dir = dir.path().to_path_buf();
        file.recovery.pacing_ms = 0;
        let config = file.into_monitor_config().unwrap();

        let up = Arc::new(AtomicBool::new(true));
        let probe = |kind| -> Arc<dyn Probe> {
            Arc::new(SwitchProbe {
                kind,
                up: up.clone(),
            })
        };
        let engine = ProbeEngine::new(config.location_id.clone())
            .with_probe(probe(ProbeKind::Reach), vec!["8.8.8.8".into()], Duration::from_secs(1))
            .with_probe(probe(ProbeKind::Web), vec!["https://example.com".into()], Duration::from_secs(1));
        (config, engine, up, dir)
    }

    fn harness(with_sink: bool) -> Harness {
        let (config, engine, up, dir) = setup();
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemorySink::new())));
        let delivery = with_sink
            .then(|| DeliveryClient::new(connector.clone(), RetryPolicy::default()));
        Harness {
            agent: Agent::new(config, engine, delivery).unwrap(),
            up,
            connector,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_records_are_replayed_after_restore() {
        let mut h = harness(true);

        let first = h.agent.run_cycle().await;
        assert!(first.connected);
        assert!(first.recovery.is_some());
        assert_eq!(first.buffer_health.len, 0);

        h.up.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            let report = h.agent.run_cycle().await;
            assert!(!report.connected);
            assert_eq!(report.delivered, 0);
        }
        // One outage start plus three checks.
        assert_eq!(h.agent.buffer_health().len, 4);
        assert_eq!(h.connector.sink().rows(Table::ConnectivityChecks).len(), 1);

        tokio::time::advance(h.agent.config().recovery_cooldown).await;
        h.up.store(true, Ordering::SeqCst);
        let restored = h.agent.run_cycle().await;
        assert!(matches!(restored.status_change, Some(StatusChangeEvent::OutageEnd { .. })));
        let recovery = restored.recovery.unwrap();
        assert_eq!(recovery.connectivity_checks, 4);
        assert_eq!(recovery.outages_started, 1);
        assert_eq!(recovery.outages_completed, 1);
        assert_eq!(recovery.remaining, 0);

        let outages = h.connector.sink().rows(Table::Outages);
        assert_eq!(outages.len(), 1);
        assert_eq!(outages[0][6], Cell::text(STATUS_RESOLVED));
        assert_eq!(h.connector.sink().rows(Table::ConnectivityChecks).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_live_delivery_stays_buffered_and_is_swept() {
        let mut h = harness(true);
        h.agent.run_cycle().await;

        h.connector
            .sink()
            .fail_always(Some(SinkError::Transport("connection refused".into())));
        let report = h.agent.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.buffer_health.len, 1);

        h.connector.sink().fail_always(None);
        let mut swept = None;
        for _ in 0..10 {
            if let Some(recovery) = h.agent.run_cycle().await.recovery {
                swept = Some(recovery);
            }
        }
        assert_eq!(swept.unwrap().remaining, 0);
        assert_eq!(h.connector.sink().rows(Table::ConnectivityChecks).len(), 12);
    }

    #[tokio::test]
    async fn test_local_only_mode_keeps_everything() {
        let mut h = harness(false);
        h.agent.run_cycle().await;
        h.agent.run_cycle().await;
        assert_eq!(h.agent.buffer_health().len, 2);
        assert!(h.connector.sink().calls().is_empty());

        let report = h.agent.shutdown().await.unwrap();
        assert_eq!(report.final_drain, None);
        assert_eq!(report.buffer_health.len, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_signal_and_drains() {
        let mut h = harness(true);
        h.connector
            .sink()
            .fail_always(Some(SinkError::Unknown("HTTP 400".into())));

        let (tx, rx) = watch::channel(false);
        let connector = h.connector.clone();
        let stopper = async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            connector.sink().fail_always(None);
            tx.send(true).unwrap();
            tx
        };
        let (result, _tx) = tokio::join!(h.agent.run(rx), stopper);
        let report = result.unwrap();

        let drained = report.final_drain.unwrap();
        assert!(drained.delivered() > 0);
        assert_eq!(report.buffer_health.len, 0);
        assert!(!report.drain_timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_inside_cooldown_waits_for_ordered_replay() {
        let mut h = harness(true);
        let first = h.agent.run_cycle().await;
        assert!(first.recovery.is_some());

        h.up.store(false, Ordering::SeqCst);
        h.agent.run_cycle().await;
        assert_eq!(h.agent.buffer_health().len, 2);

        // Back up while the recovery slot from the first cycle is still cooling down.
        h.up.store(true, Ordering::SeqCst);
        let restored = h.agent.run_cycle().await;
        assert!(matches!(restored.status_change, Some(StatusChangeEvent::OutageEnd { .. })));
        assert_eq!(restored.recovery, None);
        assert_eq!(restored.delivered, 0);
        assert_eq!(restored.buffer_health.len, 4);
        assert!(h.connector.sink().rows(Table::Outages).is_empty());

        tokio::time::advance(h.agent.config().recovery_cooldown).await;
        let replay = h.agent.run_cycle().await.recovery.unwrap();
        assert_eq!(replay.outages_started, 1);
        assert_eq!(replay.outages_completed, 1);
        assert_eq!(replay.connectivity_checks, 3);
        assert_eq!(replay.remaining, 0);

        // Start: existence check then append. End: resolved in place.
        let outage_ops: Vec<SinkOp> = h
            .connector
            .sink()
            .row_calls()
            .into_iter()
            .map(|call| call.op)
            .filter(|op| *op != SinkOp::Append(Table::ConnectivityChecks))
            .collect();
        assert_eq!(
            outage_ops,
            vec![
                SinkOp::FindAndUpdate(Table::Outages),
                SinkOp::Append(Table::Outages),
                SinkOp::FindAndUpdate(Table::Outages),
            ]
        );
        let outages = h.connector.sink().rows(Table::Outages);
        assert_eq!(outages.len(), 1);
        assert_eq!(outages[0][6], Cell::text(STATUS_RESOLVED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_records_never_overtake_backlog() {
        let mut h = harness(true);
        h.agent.run_cycle().await;

        h.connector
            .sink()
            .fail_always(Some(SinkError::Unknown("HTTP 400".into())));
        assert_eq!(h.agent.run_cycle().await.failed, 1);

        h.connector.sink().fail_always(None);
        let held = h.agent.run_cycle().await;
        assert_eq!(held.delivered, 0);
        assert_eq!(held.recovery, None);
        assert_eq!(held.buffer_health.len, 2);
        assert_eq!(h.connector.sink().rows(Table::ConnectivityChecks).len(), 1);
    }

    /// Once armed, turns the buffer file into a directory on the next append,
    /// so the agent's follow-up write fails.
    #[derive(Clone)]
    struct BufferBreaker {
        buffer_path: std::path::PathBuf,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Sink for BufferBreaker {
        async fn ensure_schema(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn append_row(&self, _table: Table, _row: Row) -> Result<(), SinkError> {
            if !self.armed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.buffer_path.is_file() {
                std::fs::remove_file(&self.buffer_path).unwrap();
                std::fs::create_dir(&self.buffer_path).unwrap();
            }
            Err(SinkError::Unknown("HTTP 400".into()))
        }

        async fn find_and_update_row(
            &self,
            _table: Table,
            _matcher: &RowMatch,
            _updates: &[CellUpdate],
        ) -> Result<bool, SinkError> {
            Ok(false)
        }
    }

    #[async_trait]
    impl SinkConnector for BufferBreaker {
        async fn connect(&self) -> Result<Arc<dyn Sink>, SinkError> {
            Ok(Arc::new(self.clone()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpersisted_attempt_keeps_record_and_counts_write_failure() {
        let (config, engine, _up, _dir) = setup();
        let breaker = BufferBreaker {
            buffer_path: config.buffer_path.clone(),
            armed: Arc::new(AtomicBool::new(false)),
        };
        let armed = breaker.armed.clone();
        let delivery = DeliveryClient::new(Arc::new(breaker), RetryPolicy::default());
        let mut agent = Agent::new(config, engine, Some(delivery)).unwrap();

        assert_eq!(agent.run_cycle().await.buffer_health.len, 0);

        armed.store(true, Ordering::SeqCst);
        let report = agent.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.buffer_health.len, 1);
        assert_eq!(report.buffer_health.write_failures, 1);
    }
}
