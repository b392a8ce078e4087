// ingestor: Receives freezer sensor telemetry and maintains the shared table.
//
// Runtime: load config, start the service (load table, bind, spawn acceptor
// and scheduler), wait for SIGINT/SIGTERM, then stop, drain and flush.

use clap::{Arg, Command};
use ingestor::config::{ServiceConfig, load_config_from_path};
use ingestor::IngestService;
use std::path::PathBuf;
use tracing::{error, info};

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

fn validate_host_value(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err("Host must not be empty".to_owned());
    }
    Ok(value.to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ingestor starting");

    let matches = Command::new("Freezer Monitor: Ingestor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Receives sensor telemetry and persists it for the dashboard")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("host")
                .help("Address to listen on (default: this machine's resolved IP)")
                .long("host")
                .value_parser(validate_host_value),
        )
        .arg(
            Arg::new("port")
                .help("Port to listen on")
                .short('p')
                .long("port")
                .value_parser(validate_port_value),
        )
        .arg(
            Arg::new("table")
                .help("Path of the shared table file")
                .short('t')
                .long("table")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let mut cfg = match matches.get_one::<PathBuf>("config") {
        Some(path) => match load_config_from_path(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "config loaded");
                cfg
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => ServiceConfig::default(),
    };
    if let Some(host) = matches.get_one::<String>("host") {
        cfg.listen.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        cfg.listen.port = *port;
    }
    if let Some(table) = matches.get_one::<PathBuf>("table") {
        cfg.storage.table_path = table.clone();
    }

    info!(
        listen = %cfg.listen.bind_addr(),
        table = %cfg.storage.table_path.display(),
        retention_days = cfg.retention.window.num_days(),
        flush = ?cfg.flush,
        "configuration"
    );

    let service = match IngestService::start(cfg).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to start ingestor: {}", e);
            std::process::exit(1);
        }
    };

    wait_for_signal().await;
    service.stop();

    match service.join().await {
        Ok(report) => {
            info!(
                connections = report.acceptor.connections,
                records = report.acceptor.records,
                rejected = report.acceptor.rejected,
                periodic_flushes = report.periodic_flushes,
                final_rows = report.final_flush.rows,
                "ingestor shutdown complete"
            );
        }
        Err(e) => {
            error!(error = %e, "ingestor stopped without persisting its buffer");
            std::process::exit(1);
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
