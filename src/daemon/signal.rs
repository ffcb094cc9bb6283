//! OS signal handling for SIGTERM and SIGINT.
//!
//! Signals are just another way to request cancellation: they trigger the
//! same cooperative token as the `cancel` CLI command, so the orchestrator
//! rolls back, keeps the partial snapshot for resume and releases the lock.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn a task that cancels `cancel` on the first SIGINT or SIGTERM.
/// The task exits on its own once the token is cancelled by anyone.
pub fn spawn_signal_listener(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT, cancelling backup...");
                cancel.cancel();
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling backup...");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled_elsewhere() {
        let cancel = CancellationToken::new();
        let handle = spawn_signal_listener(cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
    }
}
