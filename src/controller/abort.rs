//! Operator abort.

use std::sync::Arc;

use tokio::sync::watch;

/// Requests that a running plan stop and vent.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    /// A handle that has not fired.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request an abort. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `abort` has been called.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Observer half, handed to the controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observed by the controller at every loop boundary and before every device call.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an abort has been requested. Pends forever if the handle is dropped
    /// without aborting.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
