//! Coordinated shutdown for the controller.
//!
//! A `watch` channel broadcasts the shutdown decision; the ticker and any
//! other long-running loop hold a [`ShutdownSignal`] and exit their select
//! loops once it fires. In-flight ticks are safe to interrupt: the engine
//! orders its writes so a re-run converges.

use tokio::sync::watch;
use tracing::info;

/// Triggers shutdown, held by `main`.
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
        info!("shutdown signaled");
    }
}

/// Awaitable shutdown notification, cloned into each component.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is signaled (or the handle is dropped).
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownHandle { sender }, ShutdownSignal { receiver })
}

/// Block until SIGTERM or SIGINT arrives; returns the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

/// Block until Ctrl+C arrives (non-Unix platforms).
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
