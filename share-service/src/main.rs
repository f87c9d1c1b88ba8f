//! Share Service entry point.

use share_service::config::ShareConfig;
use share_service::services::{get_metrics, init_metrics};
use share_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

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

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = ShareConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        otlp_endpoint = ?config.otlp_endpoint,
        "Starting share-service"
    );

    init_metrics();

    // The credential file holds tokens, so only its path is logged.
    tracing::info!(
        service_name = %config.service_name,
        api_base_url = %config.plex.api_base_url,
        policy_path = %config.store.policy_path.display(),
        credential_path = %config.store.credential_path.display(),
        reconcile_interval_secs = config.reconcile.interval_secs,
        local_users = config.reconcile.local_users.len(),
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let shutdown = app.shutdown_token();
    let mut running = tokio::spawn(app.run_until_stopped());

    tokio::select! {
        result = &mut running => {
            return finish(result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
            shutdown.cancel();
        }
    }

    finish(running.await)?;
    tracing::debug!(metrics = %get_metrics(), "Final metrics snapshot");
    tracing::info!("Service shutdown complete");
    Ok(())
}

fn finish(
    result: Result<Result<(), service_core::error::AppError>, tokio::task::JoinError>,
) -> std::io::Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Application error");
            Err(std::io::Error::other(e.to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "Application task failed");
            Err(std::io::Error::other(e.to_string()))
        }
    }
}
