//! Run-once cleanup actions for a scan.
//!
//! Actions that must happen no matter how a scan ends (close the shutter,
//! restore the reset velocity) are registered here and run in reverse order
//! of registration. Async code cannot run in `Drop`, so the owner must call
//! [`Finalizer::run`]; dropping an armed finalizer only logs an error.

use flyscan_core::error::UnstageFailure;
use futures::future::BoxFuture;
use tracing::{error, info};

/// Type alias for async cleanup functions.
pub type AsyncCleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registry of cleanup actions that runs at most once.
#[derive(Default)]
pub struct Finalizer {
    actions: Vec<(String, AsyncCleanupFn)>,
    ran: bool,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field(
                "actions",
                &self.actions.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("ran", &self.ran)
            .finish()
    }
}

impl Finalizer {
    /// Create an empty finalizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action.
    ///
    /// Actions run in reverse order of registration (LIFO). Registering after
    /// the finalizer ran is ignored.
    pub fn register(&mut self, name: impl Into<String>, action: AsyncCleanupFn) {
        let name = name.into();
        if self.ran {
            error!(action = %name, "Cleanup registered after finalizer ran, ignoring");
            return;
        }
        self.actions.push((name, action));
    }

    /// Whether the finalizer already ran.
    pub fn has_run(&self) -> bool {
        self.ran
    }

    /// Names of pending actions in registration order.
    pub fn pending(&self) -> Vec<&str> {
        self.actions.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, most recent first.
    ///
    /// A failing action does not stop the others. Failures are returned so
    /// they can be reported behind the error that ended the scan. Calling
    /// this a second time does nothing.
    pub async fn run(&mut self) -> Vec<UnstageFailure> {
        if self.ran {
            return Vec::new();
        }
        self.ran = true;

        let mut failures = Vec::new();
        while let Some((name, action)) = self.actions.pop() {
            info!("Running cleanup: {}", name);
            if let Err(e) = action().await {
                error!(action = %name, error = %e, "Cleanup failed");
                failures.push(UnstageFailure::finalize(name, &e));
            }
        }
        failures
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if !self.ran && !self.actions.is_empty() {
            // Can't call async in drop, log error
            error!(
                "Finalizer dropped without running! {} cleanup actions skipped: {:?}",
                self.actions.len(),
                self.pending()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_core::error::Phase;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) -> AsyncCleanupFn {
        let log = log.clone();
        Box::new(move || {
            async move {
                log.lock().unwrap().push(entry);
                anyhow::Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_actions_run_lifo_once() {
        let log = Log::default();
        let mut finalizer = Finalizer::new();
        finalizer.register("restore_velocity", record(&log, "velocity"));
        finalizer.register("close_shutter", record(&log, "shutter"));
        assert_eq!(finalizer.pending(), vec!["restore_velocity", "close_shutter"]);

        assert!(finalizer.run().await.is_empty());
        assert!(finalizer.run().await.is_empty());

        assert_eq!(*log.lock().unwrap(), vec!["shutter", "velocity"]);
        assert!(finalizer.has_run());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_remaining_actions() {
        let log = Log::default();
        let mut finalizer = Finalizer::new();
        finalizer.register("restore_velocity", record(&log, "velocity"));
        finalizer.register(
            "close_shutter",
            Box::new(|| async { Err::<(), _>(anyhow::anyhow!("shutter jammed")) }.boxed()),
        );

        let failures = finalizer.run().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].participant, "close_shutter");
        assert_eq!(failures[0].phase, Phase::Finalize);
        assert!(failures[0].message.contains("jammed"));
        assert_eq!(*log.lock().unwrap(), vec!["velocity"]);
    }

    #[tokio::test]
    async fn test_late_registration_ignored() {
        let log = Log::default();
        let mut finalizer = Finalizer::new();
        finalizer.run().await;
        finalizer.register("close_shutter", record(&log, "shutter"));
        assert!(finalizer.is_empty());
    }
}
