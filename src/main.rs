//! Device health service
//!
//! Reads fault notifications as JSON lines on stdin, records them in the
//! crash-persistent region and publishes each device's health into a
//! directory of health objects.
//!
//! ```text
//! {"event":"asserted","device":"GPU0","error_id":"E1","severity":"Critical"}
//! {"event":"deasserted","device":"GPU0","error_id":"E1"}
//! {"event":"log_entry","path":"/xyz/openbmc_project/logging/entry/12","severity":"xyz.openbmc_project.Logging.Entry.Level.Warning","event_id":"E2","additional_data":["DEVICE_NAME=GPU1"]}
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use device_health::config::ServiceConfig;
use device_health::health::DirectorySink;
use device_health::ingest::InboundEvent;
use device_health::messages::HealthCommand;
use device_health::service::HealthService;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Device health service CLI
#[derive(Parser)]
#[command(name = "device_health_service")]
#[command(about = "Tracks asserted device errors and publishes device health", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DEVICE_HEALTH_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one health object per device
    #[arg(long, default_value = "/run/device-health")]
    health_dir: PathBuf,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path),
        None => ServiceConfig::load(),
    }
    .context("Failed to load configuration")?;

    if cli.dump_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    init_tracing(&config.application.log_level, cli.json_logs);
    info!(
        name = %config.application.name,
        region = %config.region.path.display(),
        health_dir = %cli.health_dir.display(),
        deassertion_enabled = config.ingest.deassertion_enabled,
        "starting"
    );

    let sink = DirectorySink::new(&cli.health_dir);
    let service =
        HealthService::open(&config, sink).context("Failed to open the persistent store")?;
    let (tx, mut service_task) = service.spawn(COMMAND_CHANNEL_CAPACITY);
    let max_error_id_length = config.store.max_error_id_length;

    let finished = tokio::select! {
        joined = &mut service_task => Some(joined),
        ingest = ingest_stdin(&tx, max_error_id_length) => {
            ingest?;
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            None
        }
    };

    let joined = match finished {
        Some(joined) => joined,
        None => {
            let (command, done) = HealthCommand::shutdown();
            if tx.send(command).await.is_ok() {
                let _ = done.await;
            }
            drop(tx);
            service_task.await
        }
    };
    joined.context("Health service task failed")??;
    Ok(())
}

fn init_tracing(log_level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Forward stdin notifications to the service until EOF or until the service
/// stops accepting commands.
async fn ingest_stdin(tx: &mpsc::Sender<HealthCommand>, max_error_id_length: usize) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: InboundEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping unparseable notification");
                continue;
            }
        };
        if let InboundEvent::LogEntry(entry) = &event {
            debug!(entry_id = ?entry.entry_id(), path = %entry.path, "log entry received");
        }
        let notification = match event.into_notification(max_error_id_length) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "dropping malformed notification");
                continue;
            }
        };

        let (command, response) = HealthCommand::notify(notification);
        if tx.send(command).await.is_err() {
            break;
        }
        match response.await {
            Ok(outcome) => debug!(?outcome, "notification applied"),
            Err(_) => break,
        }
    }

    info!("ingest stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var("DEVICE_HEALTH_CONFIG", "/etc/device_health.toml");
        let cli = Cli::try_parse_from(["device_health_service"]).unwrap();
        std::env::remove_var("DEVICE_HEALTH_CONFIG");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/device_health.toml")));

        let cli = Cli::try_parse_from(["device_health_service", "--config", "local.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("local.toml")));
    }
}
