use clap::Parser;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use connwatch::agent_modules::config::DEFAULT_CONFIG_PATH;
use connwatch::version::VERSION;
use connwatch::{Agent, load_agent_config};

/// Internet connectivity monitor with durable outage telemetry.
#[derive(Parser, Debug)]
#[command(name = "connwatch-agent", version = VERSION, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CONNWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Location identifier (overrides config file)
    #[arg(long, env = "LOCATION_ID")]
    location_id: Option<String>,

    /// Seconds between checks (overrides config file)
    #[arg(long, env = "CHECK_INTERVAL")]
    check_interval: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Run a single check cycle, deliver, and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(log_dir: &Path) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "agent.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received; finishing the current cycle.");
    let _ = tx.send(true);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let (config_path, allow_missing) = match cli.config {
        Some(path) => (path, false),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), true),
    };
    let mut file_config = load_agent_config(&config_path, allow_missing)?;
    file_config.apply_overrides(cli.location_id, cli.check_interval);

    if cli.print_config {
        print!("{}", file_config.to_toml()?);
        return Ok(());
    }

    let config = file_config.into_monitor_config()?;
    std::fs::create_dir_all(config.log_dir())?;
    init_logging(&config.log_dir());
    info!(version = VERSION, location_id = %config.location_id, "Starting connectivity agent...");

    let mut agent = match Agent::from_config(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Critical error during start-up. Exiting.");
            return Err(e.into());
        }
    };

    let report = if cli.once {
        let cycle = agent.run_cycle().await;
        info!(connected = cycle.connected, delivered = cycle.delivered, "Single check finished.");
        agent.shutdown().await
    } else {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(shutdown_signal(tx));
        agent.run(rx).await
    };

    match report {
        Ok(report) => {
            info!(
                remaining = report.buffer_health.len,
                evicted = report.buffer_health.evicted,
                dropped = report.buffer_health.dropped,
                "Shutdown complete."
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Shutdown failed; buffered records may not be on disk.");
            Err(e.into())
        }
    }
}
