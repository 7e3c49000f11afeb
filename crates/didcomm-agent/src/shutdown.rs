//! Cancellable run context.
//!
//! A [`ShutdownHandle`] flips a watch channel once; every [`ShutdownSignal`]
//! cloned from the pair observes it. Dropping the handle without triggering
//! does not shut anything down.

use std::sync::Arc;

use tokio::sync::watch;

/// Create a connected handle/signal pair
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle(Arc::new(tx)), ShutdownSignal(rx))
}

/// Triggers shutdown
#[derive(Clone, Debug)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// A new signal observing this handle
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

/// Observes shutdown
#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolve once shutdown is requested. Cancel-safe.
    pub async fn wait(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            // Handle dropped without triggering: never resolve
            std::future::pending::<()>().await;
        }
    }

    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}
