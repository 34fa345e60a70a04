/// Operator interrupts (SIGINT / SIGTERM) for the HTTP server.
///
/// This only stops serving. It never runs the autostop shutdown sequence, so an
/// interrupted watchdog does not stop the cloud instance.
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down HTTP server"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down HTTP server"),
    }
}
