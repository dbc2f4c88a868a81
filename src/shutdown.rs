//! Process shutdown signals.
//!
//! On Unix this waits for SIGINT, SIGTERM or SIGQUIT; elsewhere only Ctrl-C.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel `token` once a shutdown signal arrives.
///
/// If signal handlers cannot be installed the token is cancelled right away,
/// so the process never runs without a way to stop.
pub async fn cancel_on_signal(token: CancellationToken) {
    match wait_for_shutdown_signal().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!(error = %err, "failed to install signal handlers, shutting down"),
    }
    token.cancel();
}
