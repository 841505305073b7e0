//! scatter-hub: central coordinator of the scatter distributed proxy.
//!
//! Receives incoming HTTP proxy requests (plain and CONNECT) and spreads
//! them across the configured probe pool round-robin, so consecutive
//! client connections egress from different addresses. Optionally exposes
//! a telemetry subscription port.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scatter_core::conn::Dialer;
use scatter_core::logging::init_logging;

use scatter_hub::{Config, HttpProxy, HubCore, ProbeClient, TelemetryServer};

/// scatter-hub — distributed proxy coordinator
#[derive(Parser, Debug)]
#[command(name = "scatter-hub", version, about = "scatter proxy hub")]
struct Cli {
    /// Config file path (overridden by the CONFIG_FILE environment variable)
    #[arg(long, default_value = "config/hub.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error loading config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_level, &config.log_format) {
        eprintln!("error creating logger: {e}");
        std::process::exit(1);
    }

    let endpoints = match config.probe_endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!(error = %e, "failed to resolve probe endpoints");
            std::process::exit(1);
        }
    };
    let probe_hosts: Vec<&str> = endpoints.iter().map(|e| e.host.as_str()).collect();
    let probes: Vec<Arc<dyn Dialer>> = endpoints
        .iter()
        .map(|endpoint| Arc::new(ProbeClient::new(endpoint)) as Arc<dyn Dialer>)
        .collect();

    let core = match HubCore::new(probes) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!(error = %e, "failed to create hub core");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.log_level,
        log_format = %config.log_format,
        probe_hosts = ?probe_hosts,
        "starting hub server"
    );

    let shutdown = CancellationToken::new();

    if let Some(telemetry_config) = &config.telemetry {
        let secret = match telemetry_config.secret() {
            Ok(secret) => secret,
            Err(e) => {
                error!(error = %e, "failed to resolve telemetry secret");
                std::process::exit(1);
            }
        };
        let telemetry = Arc::new(TelemetryServer::new(secret));
        core.register_telemetry(telemetry.as_ref());
        if let Err(e) = telemetry.start_broadcasting(shutdown.clone()) {
            error!(error = %e, "failed to start telemetry broadcasting");
            std::process::exit(1);
        }

        let listener = match TcpListener::bind(("0.0.0.0", telemetry_config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = telemetry_config.port, error = %e, "failed to listen on telemetry port");
                std::process::exit(1);
            }
        };
        info!(port = telemetry_config.port, "telemetry server listening");
        tokio::spawn(async move {
            if let Err(e) = telemetry.run(listener).await {
                error!(error = %e, "telemetry server failed");
            }
        });
    }

    let http_config = match &config.proxies.http {
        Some(http_config) => http_config,
        None => {
            error!("no proxies are enabled");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", http_config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = http_config.port, error = %e, "failed to listen on proxy port");
            std::process::exit(1);
        }
    };
    info!(port = http_config.port, "proxy server listening");

    let proxy = HttpProxy::new(core);
    tokio::select! {
        result = proxy.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "proxy server failed");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            shutdown.cancel();
        }
    }

    info!("hub server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
