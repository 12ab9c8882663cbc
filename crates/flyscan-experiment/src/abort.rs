//! Operator abort signalling.
//!
//! An [`AbortHandle`] is held by whoever can interrupt a scan (Ctrl-C
//! handler, GUI, test). The coordinator holds the matching [`AbortSignal`]
//! and races every hardware call against it.

use flyscan_core::error::{FlyscanError, FlyscanResult};
use std::sync::Arc;
use tokio::sync::watch;

/// Create a connected handle/signal pair.
pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Requests an abort.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl AbortHandle {
    /// Request an abort. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let accepted = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if accepted {
            tracing::warn!(reason = %reason, "Abort requested");
        }
    }

    /// Whether an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Another signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes abort requests.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(None);
        Self { rx }
    }

    /// Abort reason, if one was requested.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Whether an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// `Err(Aborted)` once an abort has been requested.
    pub fn check(&self) -> FlyscanResult<()> {
        match self.reason() {
            Some(reason) => Err(FlyscanError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolve with the reason once an abort is requested.
    ///
    /// Stays pending forever if every handle is dropped without aborting.
    pub async fn aborted(&self) -> String {
        let mut rx = self.rx.clone();
        let reason = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
        match reason {
            Ok(reason) => reason.unwrap_or_default(),
            Err(_) => std::future::pending().await,
        }
    }
}
