//! Mock two-button shutter and read-only front-end shutter status.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::Result;
use async_trait::async_trait;
use flyscan_core::capabilities::{ShutterControl, ShutterStatus};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::time::sleep;

const DRIVER_TYPE: &str = "mock_shutter";

/// Simulated shutter that counts the commands it receives.
#[derive(Debug)]
pub struct MockShutter {
    name: String,
    open: AtomicBool,
    open_commands: AtomicU32,
    close_commands: AtomicU32,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockShutter {
    /// Closed shutter in instant mode.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open: AtomicBool::new(false),
            open_commands: AtomicU32::new(0),
            close_commands: AtomicU32::new(0),
            mode: MockMode::Instant,
            timing: TimingConfig::shutter(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Start open or closed.
    pub fn with_open(self, open: bool) -> Self {
        self.open.store(open, Ordering::SeqCst);
        self
    }

    /// Set operational mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set error injection.
    pub fn with_error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Shutter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force the reported state, as an operator or interlock would.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Number of `open` commands received.
    pub fn open_commands(&self) -> u32 {
        self.open_commands.load(Ordering::SeqCst)
    }

    /// Number of `close` commands received.
    pub fn close_commands(&self) -> u32 {
        self.close_commands.load(Ordering::SeqCst)
    }

    async fn actuate(&self, open: bool, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        if self.mode.is_timed() {
            sleep(self.timing.communication_delay() + self.timing.settling_time()).await;
        }
        self.open.store(open, Ordering::SeqCst);
        tracing::debug!(shutter = %self.name, open, "MockShutter: actuated");
        Ok(())
    }
}

#[async_trait]
impl ShutterStatus for MockShutter {
    async fn is_open(&self) -> Result<bool> {
        self.error_config.check_operation(DRIVER_TYPE, "status")?;
        Ok(self.open.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    async fn open(&self) -> Result<()> {
        self.open_commands.fetch_add(1, Ordering::SeqCst);
        self.actuate(true, "open").await
    }

    async fn close(&self) -> Result<()> {
        self.close_commands.fetch_add(1, Ordering::SeqCst);
        self.actuate(false, "close").await
    }
}
