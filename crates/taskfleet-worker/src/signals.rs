//! Termination signal listener.
//!
//! The listener only counts signals into a watch channel. The protocol
//! loop and the shutdown coordinator decide what a signal means.

use tokio::sync::watch;
use tracing::info;

use crate::error::WorkerError;

/// Number of termination signals received so far.
pub type SignalCount = watch::Receiver<usize>;

/// Install SIGINT/SIGTERM handlers and return the signal counter.
#[cfg(unix)]
pub fn listen() -> Result<SignalCount, WorkerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).map_err(WorkerError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(WorkerError::Signal)?;
    let (tx, rx) = watch::channel(0usize);

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            tx.send_modify(|count| *count += 1);
            info!(signal = name, count = *tx.borrow(), "Termination signal received");
        }
    });

    Ok(rx)
}

/// Install a Ctrl-C handler and return the signal counter.
#[cfg(not(unix))]
pub fn listen() -> Result<SignalCount, WorkerError> {
    let (tx, rx) = watch::channel(0usize);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tx.send_modify(|count| *count += 1);
            info!(count = *tx.borrow(), "Ctrl-C received");
        }
    });

    Ok(rx)
}

/// Wait until the count moves past what `signals` has already seen.
///
/// Never resolves once the listener is gone.
pub async fn next_signal(signals: &mut SignalCount) {
    if signals.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
