//! OS signal handling.
//!
//! SIGINT (Ctrl+C) and, on Unix, SIGTERM trigger graceful shutdown. Config
//! reload is file-driven (see `config::watcher`), so SIGHUP is not used.

use crate::lifecycle::shutdown::Shutdown;

/// Wait for a termination signal, then trigger `shutdown`.
pub async fn shutdown_on_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    shutdown.trigger();
}
