use anyhow::Result;
use std::fmt;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Signals that stop the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    #[cfg(unix)]
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            #[cfg(unix)]
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for the first termination signal (Ctrl+C, SIGTERM).
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let received = tokio::select! {
        result = wait_interrupt() => result?,
        result = wait_terminate() => result?,
    };
    tracing::info!(signal = %received, "Shutdown signal received, stopping services");
    Ok(received)
}

/// Cancel `cancel` on the first termination signal.
///
/// The watcher also returns once `cancel` fires for another reason. If the
/// handlers cannot be installed the runtime keeps running and can only be
/// stopped through `cancel`.
#[must_use]
pub fn cancel_on_signal(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            result = wait_for_shutdown() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Signal handling unavailable");
                    return;
                }
                cancel.cancel();
            }
        }
    })
}

async fn wait_interrupt() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        e
    })?;
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(unix)]
async fn wait_terminate() -> Result<ShutdownSignal> {
    let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
        tracing::error!(%e, "Failed to install SIGTERM handler");
        e
    })?;
    handler.recv().await;
    Ok(ShutdownSignal::Terminate)
}

#[cfg(not(unix))]
async fn wait_terminate() -> Result<ShutdownSignal> {
    std::future::pending::<Result<ShutdownSignal>>().await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn watcher_exits_when_cancelled_elsewhere() {
        let cancel = CancellationToken::new();
        let watcher = cancel_on_signal(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
