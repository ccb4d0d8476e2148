use tokio::sync::broadcast;

/// Listens for the process-wide shutdown signal.
///
/// A single `()` is sent on the broadcast channel (or the sender is dropped) when the control loop
/// stops. Every task that needs to wind down holds its own `Shutdown`.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the signal has been seen, so later calls to `recv` return immediately.
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Wait for the shutdown signal.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Lagging is impossible with a single message; a closed channel means shutdown too.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

impl From<broadcast::Receiver<()>> for Shutdown {
    fn from(notify: broadcast::Receiver<()>) -> Self {
        Self::new(notify)
    }
}

#[tokio::test]
async fn dropped_sender_counts_as_shutdown() {
    let (notify, _) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::from(notify.subscribe());
    let mut other = shutdown.clone();

    drop(notify);
    shutdown.recv().await;
    other.recv().await;

    assert!(shutdown.is_shutdown());
    assert!(other.is_shutdown());
    // once seen, never waits again
    shutdown.recv().await;
}
