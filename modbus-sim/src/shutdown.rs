//! Shutdown signalling between the listener and its connections, after the pattern used by
//! mini-redis.

use tokio::sync::{broadcast, mpsc};

type Notify = broadcast::Receiver<()>;
type Guard = mpsc::Sender<()>;

/// Listens for the server shutdown signal.
///
/// The listener owns the `broadcast::Sender`; dropping it (or sending a value) tells every
/// `Shutdown` that the server is going away. Each connection also carries a clone of an `mpsc`
/// guard, so the listener knows all connections have finished once the receiving side reports
/// the channel closed.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the signal has been received.
    shutdown: bool,

    notify: Notify,

    /// Dropped together with the connection that holds it.
    _guard: Guard,
}

impl Shutdown {
    pub(crate) fn with_guard(notify: Notify, guard: Guard) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
            _guard: guard,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Waits for the shutdown notice, returning immediately if it already arrived.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Only one value is ever sent, and a closed channel means the same thing.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

#[tokio::test]
async fn closing_the_sender_signals_shutdown() {
    let (notify, _) = broadcast::channel(1);
    let (guard, mut complete) = mpsc::channel::<()>(1);

    let mut shutdown = Shutdown::with_guard(notify.subscribe(), guard);
    assert!(!shutdown.is_shutdown());

    drop(notify);
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());

    // Already received, so this returns immediately.
    shutdown.recv().await;

    drop(shutdown);
    assert_eq!(complete.recv().await, None);
}
