use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use laneclock_server::ServerConfig;
use laneclock_telemetry::TelemetryConfig;

/// Live race timing server for one admin and eight lane operators.
#[derive(Debug, Parser)]
#[command(name = "laneclock", version)]
struct Cli {
    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Host to bind (overrides HOST).
    #[arg(long)]
    host: Option<String>,
    /// Browser origin allowed by CORS (overrides CLIENT_URL).
    #[arg(long)]
    client_url: Option<String>,
    /// Persist warn+ logs to this SQLite file (overrides LANECLOCK_LOG_DB).
    #[arg(long)]
    log_db: Option<PathBuf>,
    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
    /// Per-module log level, e.g. `laneclock_server=debug`. Repeatable;
    /// appended to LANECLOCK_LOG_MODULES.
    #[arg(long = "log-module", value_name = "MODULE=LEVEL", value_parser = laneclock_telemetry::parse_module_level)]
    log_modules: Vec<(String, tracing::Level)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    if cli.log_db.is_some() {
        telemetry_config.log_db_path = cli.log_db.clone();
    }
    telemetry_config.json |= cli.json_logs;
    telemetry_config.module_levels.extend(cli.log_modules);
    let telemetry = laneclock_telemetry::init_telemetry(telemetry_config);

    let mut config = ServerConfig::from_env().context("invalid server configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(origin) = cli.client_url {
        config.allowed_origin = Some(origin);
    }

    tracing::info!(addr = %config.bind_addr(), origin = ?config.allowed_origin, "Starting race timing server");

    let handle = laneclock_server::start(config, telemetry.logs())
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Race timing server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown_and_wait(Duration::from_secs(5)).await;
    Ok(())
}
