use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;

use meshgated::center::Center;
use meshgated::config::Config;
use meshgated::log::Logger;
use meshgated::{http, manager};

#[derive(Parser, Debug)]
#[command(
    name = "meshgated",
    version,
    about = "Projects an overlay network into DNS, a reverse proxy, and a TLS certificate."
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/meshgated/config.yaml")]
    config: Utf8PathBuf,

    /// Parse and validate the configuration file, then exit without starting.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let logger = Logger::launch();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = logger.apply(&config.logging) {
        tracing::warn!(error = %err, "failed to apply configured log filter");
    }

    if cli.check_config {
        tracing::info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let (center, updates_rx) = match Center::build(config).await {
        Ok(built) => built,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialise control plane");
            return ExitCode::FAILURE;
        }
    };

    let unit_handles = manager::spawn_units(center.clone(), updates_rx);

    let listen_addr = center.config.http.listen_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, address = %listen_addr, "failed to bind HTTP listener");
            for handle in unit_handles {
                handle.abort();
            }
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(address = %listen_addr, "listening");
    let router = http::router(center);

    if let Err(err) = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!(error = %err, "HTTP server exited with an error");
    }

    for handle in unit_handles {
        handle.abort();
    }

    ExitCode::SUCCESS
}

/// Waits for either Ctrl+C or SIGTERM, so the proxy reload endpoint and
/// in-flight record operations get a chance to finish before the process
/// tears down its background units.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
