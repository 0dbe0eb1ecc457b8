//! Cancellation signal shared between a subscription and its caller.
//!
//! A thin wrapper over a tokio watch channel: the caller keeps the
//! [`CancelTx`] and hands a [`CancelRx`] to the subscription. Every receiver
//! observes the same signal, so one cancel stops both the snapshot read and
//! the live stream.

use tokio::sync::watch;

/// Sending side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelTx(watch::Sender<bool>);

impl CancelTx {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> CancelRx {
        CancelRx(self.0.subscribe())
    }
}

/// Receiving side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelRx(watch::Receiver<bool>);

impl CancelRx {
    /// A receiver that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelRx(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// If every [`CancelTx`] is dropped without cancelling, this never
    /// resolves.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a connected cancellation pair.
pub fn cancellation() -> (CancelTx, CancelRx) {
    let (tx, rx) = watch::channel(false);
    (CancelTx(tx), CancelRx(rx))
}
