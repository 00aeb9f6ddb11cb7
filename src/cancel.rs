//! Operator cancellation signal.
//!
//! The terminal interrupt handler holds a [`CancelTrigger`]; the orchestrator
//! races every wait against [`Cancellation::cancelled`].

use std::sync::Arc;

use tokio::sync::watch;

/// Creates a connected trigger and signal.
#[must_use]
pub fn channel() -> (CancelTrigger, Cancellation) {
    let (sender, receiver) = watch::channel(false);
    (CancelTrigger(Arc::new(sender)), Cancellation(receiver))
}

/// Raises the cancellation signal.
#[derive(Clone, Debug)]
pub struct CancelTrigger(Arc<watch::Sender<bool>>);

impl CancelTrigger {
    /// Requests cancellation. Repeated calls are harmless.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observes the cancellation signal.
#[derive(Clone, Debug)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. If every trigger is dropped
    /// first it never resolves.
    pub async fn cancelled(&mut self) {
        let dropped = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if dropped {
            std::future::pending::<()>().await;
        }
    }
}
