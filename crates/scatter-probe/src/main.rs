//! scatter-probe: egress node for the scatter distributed proxy.
//!
//! Receives forward streams from hubs, establishes outbound connections to
//! target destinations, and relays traffic bidirectionally. Probes are
//! lightweight and stateless, so they suit serverless deployments that
//! scale with demand. Configuration comes from environment variables.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use scatter_core::logging::init_logging;
use scatter_probe::{Config, ForwardServer, ForwardService};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error loading config from environment: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_level, &config.log_format) {
        eprintln!("error creating logger: {e}");
        std::process::exit(1);
    }

    let service = Arc::new(ForwardService::new());
    let server = Arc::new(ForwardServer::new(service, config.secret.clone()));

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = config.port, error = %e, "failed to listen");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        log_level = %config.log_level,
        log_format = %config.log_format,
        authentication_enabled = true,
        "starting probe server"
    );

    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "failed to serve");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("probe server stopped");
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
