//! Host entry point.

use std::process::ExitCode;

use host::{Config, HostError, telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    if let Err(error) = telemetry::init_tracing(&config) {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    // 2. Install Prometheus metrics recorder
    match telemetry::install_metrics(&config) {
        Ok(addr) => tracing::info!(%addr, "metrics listener started"),
        Err(error) => tracing::warn!(%error, "metrics disabled"),
    }

    // 3. Cancel in-flight work on shutdown
    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    // 4. Drive the sample orders through the saga
    match host::run(&config, cancellation).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(HostError::Cancelled) => {
            tracing::info!("host shut down before all orders were confirmed");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "host run failed");
            ExitCode::FAILURE
        }
    }
}
