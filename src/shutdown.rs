use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Cloneable handle to the process-wide shutdown signal.
///
/// Tasks observe the signal via [`Shutdown::await_shutdown_begin`]; the
/// signal is raised either programmatically with [`Shutdown::shutdown`] or
/// by the OS signal listener installed by [`Shutdown::spawn`].
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
    timeout: Duration,
    delay: Duration,
}

impl Shutdown {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender,
            receiver,
            timeout,
            delay,
        }
    }

    /// Creates a shutdown handle and installs the SIGINT/SIGTERM listener.
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let shutdown = Self::new(timeout, delay);

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = signal_shutdown().await {
                    tracing::error!("Error handling shutdown signal: {err}");
                }
                shutdown.shutdown();
            }
        });

        shutdown
    }

    /// Begin the shutdown sequence.
    pub fn shutdown(&self) {
        // Does not fail because this handle also holds a receiver.
        self.sender.send(true).ok();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// The grace period tasks get to finish after shutdown begins.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Minimum wait after shutdown begins, giving cancelled tasks a chance
    /// to reach an await point.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for shutdown to begin.
    ///
    /// Resolves immediately if it already has. Safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because the sender lives as long as self.
        watch.changed().await.ok();
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}
