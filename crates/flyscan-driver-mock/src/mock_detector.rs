//! Mock standard detector: a trigger-driven controller plus a frame writer.
//!
//! The detector listens on a [`TriggerLine`], turns every pulse into one
//! written frame, and reports newly written index ranges through
//! [`Collectable`]. Both the camera and the trigger unit's position capture
//! are modelled with this type; only the trigger lines and exposure
//! behaviour differ.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use crate::trigger_line::{PulseBurst, TriggerLine};
use anyhow::{bail, Result};
use async_trait::async_trait;
use flyscan_core::capabilities::{Collectable, Completable, Kickoffable, Preparable, Stageable};
use flyscan_core::data::StreamDatum;
use flyscan_core::trigger::TriggerInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const DRIVER_TYPE: &str = "mock_detector";

#[derive(Default)]
struct DetectorState {
    staged: bool,
    trigger_info: Option<TriggerInfo>,
    receiver: Option<broadcast::Receiver<PulseBurst>>,
    kicked_off: bool,
    last_collected: u64,
}

/// Simulated detector with an attached writer.
pub struct MockDetector {
    name: String,
    stream: String,
    external_line: TriggerLine,
    internal_line: Option<TriggerLine>,
    exposes: bool,
    state: Mutex<DetectorState>,
    captured_tx: Arc<watch::Sender<u64>>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockDetector {
    /// Builder for a detector named `name`, listening on `external_line`.
    pub fn builder(name: impl Into<String>, external_line: TriggerLine) -> MockDetectorBuilder {
        MockDetectorBuilder::new(name.into(), external_line)
    }

    /// Detector name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream the writer publishes to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Frames written so far.
    pub fn captured_frames(&self) -> u64 {
        *self.captured_tx.borrow()
    }

    /// Whether the detector is staged.
    pub fn staged(&self) -> bool {
        self.state.lock().staged
    }

    fn abort_capture(&self) {
        if let Some(task) = self.capture_task.lock().take() {
            task.abort();
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }
}

impl Drop for MockDetector {
    fn drop(&mut self) {
        self.abort_capture();
    }
}

#[async_trait]
impl Stageable for MockDetector {
    async fn stage(&self) -> Result<()> {
        self.check("stage")?;
        let mut state = self.state.lock();
        if state.staged {
            bail!("{} is already staged", self.name);
        }
        *state = DetectorState {
            staged: true,
            ..Default::default()
        };
        self.captured_tx.send_replace(0);
        tracing::debug!(detector = %self.name, "MockDetector: staged");
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        self.abort_capture();
        *self.state.lock() = DetectorState::default();
        tracing::debug!(
            detector = %self.name,
            captured = self.captured_frames(),
            "MockDetector: unstaged"
        );
        Ok(())
    }

    async fn is_staged(&self) -> Result<bool> {
        Ok(self.staged())
    }
}

#[async_trait]
impl Preparable<TriggerInfo> for MockDetector {
    async fn prepare(&self, info: TriggerInfo) -> Result<()> {
        self.check("prepare")?;
        if info.num == 0 {
            bail!("{}: cannot prepare for zero frames", self.name);
        }
        let line = if info.trigger.is_external() {
            &self.external_line
        } else {
            match &self.internal_line {
                Some(line) => line,
                None => bail!("{} does not support internal triggering", self.name),
            }
        };

        let mut state = self.state.lock();
        if !state.staged {
            bail!("{} must be staged before prepare", self.name);
        }
        state.receiver = Some(line.subscribe());
        state.trigger_info = Some(info);
        state.kicked_off = false;
        state.last_collected = 0;
        self.captured_tx.send_replace(0);
        tracing::debug!(
            detector = %self.name,
            num = info.num,
            trigger = %info.trigger,
            line = line.name(),
            "MockDetector: armed"
        );
        Ok(())
    }
}

#[async_trait]
impl Kickoffable for MockDetector {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        let (mut receiver, info) = {
            let mut state = self.state.lock();
            match (state.receiver.take(), state.trigger_info) {
                (Some(receiver), Some(info)) => {
                    state.kicked_off = true;
                    (receiver, info)
                }
                _ => bail!("{} must be prepared before kickoff", self.name),
            }
        };

        let expected = u64::from(info.num);
        let captured_tx = self.captured_tx.clone();
        let frame_time = if self.mode.is_timed() {
            let exposure = if self.exposes {
                Duration::from_secs_f64(info.livetime.max(0.0))
            } else {
                Duration::ZERO
            };
            exposure + self.timing.frame_readout()
        } else {
            Duration::ZERO
        };
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            while *captured_tx.borrow() < expected {
                match receiver.recv().await {
                    Ok(burst) => {
                        if !frame_time.is_zero() {
                            sleep(frame_time).await;
                        }
                        captured_tx.send_modify(|captured| {
                            let remaining = expected.saturating_sub(*captured);
                            *captured += burst.count.min(remaining);
                        });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(detector = %name, missed, "MockDetector: trigger bursts dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!(detector = %name, captured = *captured_tx.borrow(), "MockDetector: acquisition finished");
        });
        *self.capture_task.lock() = Some(task);
        Ok(())
    }
}

#[async_trait]
impl Completable for MockDetector {
    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        let expected = {
            let state = self.state.lock();
            match (state.kicked_off, state.trigger_info) {
                (true, Some(info)) => u64::from(info.num),
                _ => bail!("{} was not kicked off", self.name),
            }
        };
        let mut captured = self.captured_tx.subscribe();
        if captured.wait_for(|count| *count >= expected).await.is_err() {
            bail!("{}: writer closed before {} frames", self.name, expected);
        }
        Ok(())
    }
}

#[async_trait]
impl Collectable for MockDetector {
    async fn collect(&self) -> Result<Vec<StreamDatum>> {
        self.check("collect")?;
        let captured = self.captured_frames();
        let mut state = self.state.lock();
        if captured <= state.last_collected {
            return Ok(Vec::new());
        }
        let datum = StreamDatum::new(self.stream.clone(), state.last_collected..captured);
        state.last_collected = captured;
        Ok(vec![datum])
    }

    async fn captured_count(&self) -> Result<u64> {
        self.check("captured_count")?;
        Ok(self.captured_frames())
    }
}

/// Builder for [`MockDetector`].
pub struct MockDetectorBuilder {
    name: String,
    stream: Option<String>,
    external_line: TriggerLine,
    internal_line: Option<TriggerLine>,
    exposes: bool,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockDetectorBuilder {
    fn new(name: String, external_line: TriggerLine) -> Self {
        Self {
            name,
            stream: None,
            external_line,
            internal_line: None,
            exposes: false,
            mode: MockMode::Instant,
            timing: TimingConfig::default(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Stream name, `<name>_stream` by default.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Line used for [`flyscan_core::trigger::DetectorTrigger::Internal`].
    pub fn internal_line(mut self, line: TriggerLine) -> Self {
        self.internal_line = Some(line);
        self
    }

    /// Spend the trigger livetime on each frame in timed modes.
    pub fn exposes(mut self, exposes: bool) -> Self {
        self.exposes = exposes;
        self
    }

    /// Set operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override timing.
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set error injection.
    pub fn error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Build the detector.
    pub fn build(self) -> MockDetector {
        let stream = self
            .stream
            .unwrap_or_else(|| format!("{}_stream", self.name));
        let (captured_tx, _) = watch::channel(0);
        MockDetector {
            name: self.name,
            stream,
            external_line: self.external_line,
            internal_line: self.internal_line,
            exposes: self.exposes,
            state: Mutex::new(DetectorState::default()),
            captured_tx: Arc::new(captured_tx),
            capture_task: Mutex::new(None),
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
        }
    }
}
