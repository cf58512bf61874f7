//! Freshet Server - standalone headless live-streaming media server.
//!
//! Ingests RTMP and MPEG-TS publishers and serves RTMP, HTTP-FLV and HLS
//! players from one cooperative scheduler. The binary is a thin shell:
//! CLI parsing, configuration, bootstrap, listeners, graceful shutdown.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use freshet_core::{bootstrap_services, start_server, LocalIpDetector, NetworkContext};
use tokio::signal;

use crate::config::ServerConfig;

/// Freshet Server - headless live media streaming server.
#[derive(Parser, Debug)]
#[command(name = "freshet-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FRESHET_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// RTMP listen port (overrides config file).
    #[arg(short = 'p', long, env = "FRESHET_RTMP_PORT")]
    rtmp_port: Option<u16>,

    /// Advertise IP address (overrides config file).
    #[arg(short = 'a', long, env = "FRESHET_ADVERTISE_IP")]
    advertise_ip: Option<std::net::IpAddr>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging.
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Freshet Server v{}", env!("CARGO_PKG_VERSION"));

    // All connections share one OS thread; context switches happen only at
    // suspension points.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    // Load configuration.
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides.
    if let Some(port) = args.rtmp_port {
        config.rtmp_port = port;
    }
    if let Some(ip) = args.advertise_ip {
        config.advertise_ip = Some(ip);
    }

    // Resolve advertise IP: use explicit config, or fall back to detection.
    let network = if let Some(ip) = config.advertise_ip {
        log::info!(
            "Configuration: rtmp={}, http={}, advertise_ip={}",
            config.rtmp_port,
            config.http_port,
            ip
        );
        NetworkContext::explicit(config.rtmp_port, ip)
    } else {
        log::info!(
            "Configuration: rtmp={}, http={}, advertise_ip=auto",
            config.rtmp_port,
            config.http_port
        );
        let detector = LocalIpDetector::arc();
        NetworkContext::auto_detect(config.rtmp_port, detector).context(
            "Failed to auto-detect local IP address. \
             Please specify --advertise-ip or set FRESHET_ADVERTISE_IP to the IP \
             address that clients can reach.",
        )?
    };

    // Bootstrap services with the network configuration.
    let core_config = config.to_core_config();
    let http_port = core_config.http_listen;
    let services =
        bootstrap_services(core_config, network).context("Failed to bootstrap services")?;

    services.start_background_tasks();
    services.start_rtmp_listener();
    services.start_ts_caster();
    log::info!("Listeners started");

    // Serve HTTP-FLV, HLS and the cluster API.
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, http_port).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", http_port);

    // Wait for shutdown signal.
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown.
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
