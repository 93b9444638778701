use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Waits for SIGINT/SIGTERM and cancels the token. Services spawn this once
/// and read the token at their loop boundaries.
pub async fn listen_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => warn!("shutdown signal received: SIGTERM"),
                    _ = sigint.recv() => warn!("shutdown signal received: SIGINT"),
                }
                token.cancel();
                return;
            }
            (sigterm, sigint) => {
                if let Err(err) = sigterm.and(sigint) {
                    warn!("failed to install signal handlers: error={err}");
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown signal received: SIGINT");
                    token.cancel();
                }
                return;
            }
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("shutdown signal received: SIGINT");
        token.cancel();
    }
}
