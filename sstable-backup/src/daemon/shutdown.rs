//! SIGTERM and SIGINT handling.
//!
//! The binary races the running operation against [`wait_for_signal`].
//! When a signal wins, the operation future is dropped: its transfer tasks
//! are aborted and its guards (lock, snapshot) are released on the way out.

use std::future::Future;
use tokio::signal;
use tracing::info;

/// Signal that ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<Shutdown> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    first_signal(signal::ctrl_c(), terminated).await
}

/// Resolve with whichever of the two signal futures completes first.
async fn first_signal(
    interrupted: impl Future<Output = std::io::Result<()>>,
    terminated: impl Future<Output = ()>,
) -> std::io::Result<Shutdown> {
    let received = tokio::select! {
        result = interrupted => {
            result?;
            Shutdown::Interrupt
        }
        _ = terminated => Shutdown::Terminate,
    };

    match received {
        Shutdown::Interrupt => info!("Received SIGINT (Ctrl+C), aborting operation"),
        Shutdown::Terminate => info!("Received SIGTERM, aborting operation"),
    }
    Ok(received)
}
