//! Signal handling for graceful shutdown.

use tracing::info;

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to set up SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "signal received"),
    }
}

/// Wait for ctrl-c on non-Unix platforms.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("ctrl-c received");
}
