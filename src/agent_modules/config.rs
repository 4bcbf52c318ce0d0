use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::delivery::RetryPolicy;
use super::sink::SinkSettings;

pub const DEFAULT_CONFIG_PATH: &str = "agent_config.toml";
pub const BUFFER_FILE_NAME: &str = "connectivity_backup.json";
pub const OUTAGE_STATE_FILE_NAME: &str = "outage_state.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachMethod {
    #[default]
    Icmp,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbesSection {
    pub reach_method: ReachMethod,
    pub reach_targets: Vec<String>,
    pub web_targets: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_query_domain: String,
}

impl Default for ProbesSection {
    fn default() -> Self {
        Self {
            reach_method: ReachMethod::default(),
            reach_targets: vec!["8.8.8.8".into(), "1.1.1.1".into(), "208.67.222.222".into()],
            web_targets: vec![
                "https://google.com".into(),
                "https://cloudflare.com".into(),
                "https://github.com".into(),
            ],
            dns_servers: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            dns_query_domain: "google.com".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub reach_seconds: u64,
    pub web_seconds: u64,
    pub dns_seconds: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            reach_seconds: 5,
            web_seconds: 5,
            dns_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    /// Defaults to `<data_dir>/connectivity_backup.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub capacity: usize,
    /// Failed delivery passes after which a record is given up on.
    pub max_record_attempts: u32,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            path: None,
            capacity: 1000,
            max_record_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub max_attempts: u32,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    pub rate_limit_multiplier: f64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 1.0,
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub cooldown_seconds: u64,
    pub pacing_ms: u64,
    pub sweep_every_cycles: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300,
            pacing_ms: 100,
            sweep_every_cycles: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSection {
    pub endpoint: String,
    pub credentials_path: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    10
}

/// The TOML file as written by the operator. Every knob has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentFileConfig {
    pub location_id: String,
    pub check_interval_seconds: u64,
    pub data_dir: PathBuf,
    pub shutdown_drain_timeout_seconds: u64,
    pub probes: ProbesSection,
    pub timeouts: TimeoutsSection,
    pub buffer: BufferSection,
    pub delivery: DeliverySection,
    pub recovery: RecoverySection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkSection>,
}

impl Default for AgentFileConfig {
    fn default() -> Self {
        Self {
            location_id: "house1".into(),
            check_interval_seconds: 60,
            data_dir: PathBuf::from("data"),
            shutdown_drain_timeout_seconds: 30,
            probes: ProbesSection::default(),
            timeouts: TimeoutsSection::default(),
            buffer: BufferSection::default(),
            delivery: DeliverySection::default(),
            recovery: RecoverySection::default(),
            sink: None,
        }
    }
}

/// Loads the agent config. A missing file is only tolerated when
/// `allow_missing` is set, in which case the defaults are used.
pub fn load_agent_config(
    config_path: &Path,
    allow_missing: bool,
) -> Result<AgentFileConfig, ConfigError> {
    let absolute_path_display = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    info!(path = ?absolute_path_display, "Loading agent config.");

    let config_str = match std::fs::read_to_string(config_path) {
        Ok(raw) => raw,
        Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = ?config_path, "Config file not found; using defaults.");
            return Ok(AgentFileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: config_path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str(&config_str).map_err(|source| ConfigError::Parse {
        path: config_path.to_path_buf(),
        source,
    })
}

impl AgentFileConfig {
    /// Command line and environment values win over the file.
    pub fn apply_overrides(&mut self, location_id: Option<String>, check_interval: Option<u64>) {
        if let Some(location_id) = location_id {
            self.location_id = location_id;
        }
        if let Some(check_interval) = check_interval {
            self.check_interval_seconds = check_interval;
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut require = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        require(!self.location_id.trim().is_empty(), "location_id must not be empty");
        require(self.check_interval_seconds > 0, "check_interval_seconds must be > 0");
        require(self.timeouts.reach_seconds > 0, "timeouts.reach_seconds must be > 0");
        require(self.timeouts.web_seconds > 0, "timeouts.web_seconds must be > 0");
        require(self.timeouts.dns_seconds > 0, "timeouts.dns_seconds must be > 0");
        require(!self.probes.reach_targets.is_empty(), "probes.reach_targets must not be empty");
        require(!self.probes.web_targets.is_empty(), "probes.web_targets must not be empty");
        require(!self.probes.dns_servers.is_empty(), "probes.dns_servers must not be empty");
        require(
            !self.probes.dns_query_domain.trim().is_empty(),
            "probes.dns_query_domain must not be empty",
        );
        require(self.buffer.capacity > 0, "buffer.capacity must be > 0");
        require(self.buffer.max_record_attempts >= 1, "buffer.max_record_attempts must be >= 1");
        require(self.delivery.max_attempts >= 1, "delivery.max_attempts must be >= 1");
        require(
            self.delivery.backoff_base_seconds.is_finite() && self.delivery.backoff_base_seconds > 0.0,
            "delivery.backoff_base_seconds must be > 0",
        );
        require(
            self.delivery.backoff_multiplier >= 1.0,
            "delivery.backoff_multiplier must be >= 1",
        );
        require(
            self.delivery.rate_limit_multiplier >= 1.0,
            "delivery.rate_limit_multiplier must be >= 1",
        );
        require(
            self.shutdown_drain_timeout_seconds > 0,
            "shutdown_drain_timeout_seconds must be > 0",
        );
        if let Some(sink) = &self.sink {
            require(!sink.endpoint.trim().is_empty(), "sink.endpoint must not be empty");
            require(sink.request_timeout_seconds > 0, "sink.request_timeout_seconds must be > 0");
        }
        problems
    }

    /// Validates and freezes the configuration.
    pub fn into_monitor_config(self) -> Result<MonitorConfig, ConfigError> {
        let problems = self.problems();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems.join("; ")));
        }

        let buffer_path = self
            .buffer
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(BUFFER_FILE_NAME));

        Ok(MonitorConfig {
            location_id: self.location_id.trim().to_string(),
            check_interval: Duration::from_secs(self.check_interval_seconds),
            reach_method: self.probes.reach_method,
            reach_targets: self.probes.reach_targets,
            reach_timeout: Duration::from_secs(self.timeouts.reach_seconds),
            web_targets: self.probes.web_targets,
            web_timeout: Duration::from_secs(self.timeouts.web_seconds),
            dns_servers: self.probes.dns_servers,
            dns_query_domain: self.probes.dns_query_domain,
            dns_timeout: Duration::from_secs(self.timeouts.dns_seconds),
            buffer_path,
            buffer_capacity: self.buffer.capacity,
            max_record_attempts: self.buffer.max_record_attempts,
            retry: RetryPolicy {
                max_attempts: self.delivery.max_attempts,
                backoff_base: Duration::from_secs_f64(self.delivery.backoff_base_seconds),
                backoff_multiplier: self.delivery.backoff_multiplier,
                rate_limit_multiplier: self.delivery.rate_limit_multiplier,
            },
            recovery_cooldown: Duration::from_secs(self.recovery.cooldown_seconds),
            recovery_pacing: Duration::from_millis(self.recovery.pacing_ms),
            sweep_every_cycles: self.recovery.sweep_every_cycles,
            shutdown_drain_timeout: Duration::from_secs(self.shutdown_drain_timeout_seconds),
            sink: self.sink.map(|sink| SinkSettings {
                endpoint: sink.endpoint,
                credentials_path: sink.credentials_path,
                request_timeout: Duration::from_secs(sink.request_timeout_seconds),
            }),
            data_dir: self.data_dir,
        })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub location_id: String,
    pub check_interval: Duration,
    pub reach_method: ReachMethod,
    pub reach_targets: Vec<String>,
    pub reach_timeout: Duration,
    pub web_targets: Vec<String>,
    pub web_timeout: Duration,
    pub dns_servers: Vec<String>,
    pub dns_query_domain: String,
    pub dns_timeout: Duration,
    pub data_dir: PathBuf,
    pub buffer_path: PathBuf,
    pub buffer_capacity: usize,
    pub max_record_attempts: u32,
    pub retry: RetryPolicy,
    pub recovery_cooldown: Duration,
    pub recovery_pacing: Duration,
    /// 0 disables the periodic sweep.
    pub sweep_every_cycles: u64,
    pub shutdown_drain_timeout: Duration,
    /// `None` runs the agent in local-only mode.
    pub sink: Option<SinkSettings>,
}

impl MonitorConfig {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(OUTAGE_STATE_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
