pub mod agent_modules;
pub mod version;

pub use agent_modules::agent::{Agent, AgentError, CycleReport, ShutdownReport};
pub use agent_modules::config::{AgentFileConfig, ConfigError, MonitorConfig, load_agent_config};
pub use agent_modules::models::{
    BufferedRecord, CheckResult, ProbeKind, ProbeOutcome, StatusChangeEvent, TelemetryRecord,
};
