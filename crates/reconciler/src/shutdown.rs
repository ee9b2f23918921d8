//! Pass cancellation.
//!
//! A [`PassCancellation`] is shared by the control loop and one or more
//! passes. Tasks observe it through [`CancelToken`]s: they check it between
//! steps and race it against backoff sleeps, but never abandon a cluster call
//! that is already in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::info;

/// Signal to stop a reconciliation pass.
#[derive(Debug, Clone)]
pub struct PassCancellation {
    /// Whether cancellation has been requested.
    cancelled: Arc<AtomicBool>,
    /// Wakes tasks sleeping in backoff.
    tx: Arc<watch::Sender<bool>>,
}

impl PassCancellation {
    /// Create a new, untriggered cancellation.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Request cancellation. Calling this more than once has no further
    /// effect.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Pass cancellation requested");
        self.tx.send_replace(true);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A token tasks can wait on.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for PassCancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub(crate) const fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Check if the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires. Never completes if the sending side is
    /// dropped without firing.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
