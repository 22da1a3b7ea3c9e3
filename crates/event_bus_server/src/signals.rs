//! Termination signals that stop the broker.

use std::fmt;
use std::io;

/// The signal that asked the broker to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT, or Ctrl+C on Windows
    Interrupt,
    /// SIGTERM (Unix only)
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("interrupt"),
            ShutdownSignal::Terminate => f.write_str("terminate"),
        }
    }
}

/// Resolves with whichever termination signal arrives first.
///
/// # Errors
///
/// Fails if a signal handler cannot be installed.
pub async fn wait_for_shutdown_signal() -> anyhow::Result<ShutdownSignal> {
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            Ok(ShutdownSignal::Interrupt)
        }
        terminated = terminate() => {
            terminated?;
            Ok(ShutdownSignal::Terminate)
        }
    }
}

#[cfg(unix)]
async fn terminate() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> io::Result<()> {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "interrupt");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "terminate");
    }

    #[tokio::test]
    async fn test_waits_until_a_signal_arrives() {
        let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown_signal()).await;
        assert!(waited.is_err());
    }
}
