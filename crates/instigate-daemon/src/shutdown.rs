use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;

// ─── ShutdownSignal ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Sigterm,
    Sigint,
    /// Requested by the embedding code or a test.
    Programmatic,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

// ─── Channel ──────────────────────────────────────────────────────────────

/// Sending half. The first signal wins; later ones are ignored.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<Option<ShutdownSignal>>,
}

/// Receiving half, cloned into every loop that must stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<Option<ShutdownSignal>>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self, signal: ShutdownSignal) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.rx.borrow()
    }

    pub fn is_requested(&self) -> bool {
        self.signal().is_some()
    }

    /// Resolve once shutdown is requested. Never resolves if every trigger
    /// is dropped without firing.
    pub async fn wait(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.rx.borrow_and_update() {
                return signal;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ─── OS signals ───────────────────────────────────────────────────────────

/// Forward the first SIGINT or SIGTERM to `trigger`.
pub fn listen_for_signals(trigger: ShutdownTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_os_signal().await {
            Ok(signal) => {
                tracing::info!(signal = %signal, "shutdown requested");
                trigger.trigger(signal);
            }
            Err(e) => tracing::error!("failed to install signal handlers: {e}"),
        }
    })
}

#[cfg(unix)]
async fn wait_for_os_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok(ShutdownSignal::Sigterm),
        _ = sigint.recv() => Ok(ShutdownSignal::Sigint),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Sigint)
}
