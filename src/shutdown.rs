use tokio::signal::unix::{signal, SignalKind};

use crate::error::{NodeError, Result};
use crate::lifecycle::{LifecycleCommand, LifecycleHandle};

/// Install a handler that turns SIGTERM and SIGINT into a shutdown request.
///
/// The request goes through the same lifecycle path as the RPC `shutdown`
/// call, so in-flight jobs finish before the node stops.
pub fn install_shutdown_handler(lifecycle: LifecycleHandle) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| NodeError::Internal(format!("failed to install SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| NodeError::Internal(format!("failed to install SIGINT handler: {}", e)))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }

            // Signals keep going to the lifecycle until the node is terminal.
            if let Err(e) = lifecycle.request(LifecycleCommand::Shutdown) {
                tracing::warn!(error = %e, "Shutdown request not accepted");
            }
            if lifecycle.state().is_terminal() {
                break;
            }
        }
    });

    Ok(())
}
