//! Mock programmable trigger unit (PandA-like).
//!
//! The position-compare block follows the rotation axis position and fires
//! one pulse every `step` encoder counts once the axis passes `start`. Pulses
//! go out on the external [`TriggerLine`], where both the camera and the
//! unit's own position capture (a [`MockDetector`]) listen.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use crate::mock_detector::MockDetector;
use crate::trigger_line::TriggerLine;
use anyhow::{bail, Result};
use async_trait::async_trait;
use flyscan_core::capabilities::{
    Completable, Kickoffable, PositionCompare, Preparable, Stageable, TriggerInfoSource,
};
use flyscan_core::limits::EncoderGeometry;
use flyscan_core::trigger::{DetectorTrigger, PcompDirection, PcompSetup, TriggerInfo, TriggerState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DRIVER_TYPE: &str = "mock_panda";

/// Tolerance when deciding whether the axis reached a pulse position (counts).
const PULSE_EPSILON: f64 = 1e-6;

/// Trigger-unit timing reported to detectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PandaTriggerTiming {
    /// Gate deadtime (s).
    pub deadtime: f64,
    /// Gate livetime (s).
    pub livetime: f64,
}

impl Default for PandaTriggerTiming {
    fn default() -> Self {
        Self {
            deadtime: 0.1,
            livetime: 0.1,
        }
    }
}

#[derive(Default)]
struct PcompState {
    trigger_state: TriggerState,
    setup: Option<PcompSetup>,
    num: Option<u32>,
}

/// Trigger logic of the unit: position compare driven by the axis encoder.
pub struct MockPcompFlyer {
    name: String,
    position: watch::Receiver<f64>,
    geometry: EncoderGeometry,
    line: TriggerLine,
    timing: PandaTriggerTiming,
    state: Mutex<PcompState>,
    pulses_tx: Arc<watch::Sender<u64>>,
    task: Mutex<Option<JoinHandle<()>>>,
    error_config: ErrorConfig,
}

impl MockPcompFlyer {
    /// Flyer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pulses fired in the current acquisition.
    pub fn pulses_fired(&self) -> u64 {
        *self.pulses_tx.borrow()
    }

    /// Current arming state.
    pub fn trigger_state(&self) -> TriggerState {
        self.state.lock().trigger_state
    }

    fn abort_task(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }
}

/// Number of pulses due once the encoder has travelled `progress` counts
/// past the start position.
fn pulses_due(progress: f64, setup: &PcompSetup) -> u64 {
    if progress < -PULSE_EPSILON {
        return 0;
    }
    let crossed = (progress / setup.step as f64 + PULSE_EPSILON).floor() as u64 + 1;
    crossed.min(u64::from(setup.pulses))
}

impl Drop for MockPcompFlyer {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[async_trait]
impl PositionCompare for MockPcompFlyer {
    async fn configure_pcomp(&self, setup: PcompSetup) -> Result<()> {
        self.check("pcomp")?;
        if setup.step == 0 || setup.pulses == 0 {
            bail!("Position compare needs a non-zero step and pulse count");
        }
        self.state.lock().setup = Some(setup);
        tracing::debug!(
            start = setup.start,
            step = setup.step,
            pulses = setup.pulses,
            "MockPanda: position compare configured"
        );
        Ok(())
    }
}

#[async_trait]
impl Stageable for MockPcompFlyer {
    async fn stage(&self) -> Result<()> {
        self.check("stage")?;
        let mut state = self.state.lock();
        if state.trigger_state != TriggerState::Null {
            bail!("Trigger logic already staged (state {})", state.trigger_state);
        }
        state.trigger_state = TriggerState::Stopping;
        state.num = None;
        self.pulses_tx.send_replace(0);
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        self.abort_task();
        let mut state = self.state.lock();
        state.trigger_state = TriggerState::Null;
        state.num = None;
        Ok(())
    }

    async fn is_staged(&self) -> Result<bool> {
        Ok(self.trigger_state() != TriggerState::Null)
    }
}

#[async_trait]
impl Preparable<u32> for MockPcompFlyer {
    async fn prepare(&self, num: u32) -> Result<()> {
        self.check("prepare")?;
        let mut state = self.state.lock();
        if state.trigger_state != TriggerState::Stopping {
            bail!(
                "Trigger logic must be staged and stopped before prepare (state {})",
                state.trigger_state
            );
        }
        if let Some(setup) = state.setup {
            if setup.pulses != num {
                tracing::warn!(
                    pulses = setup.pulses,
                    num,
                    "MockPanda: pulse count differs from prepared frame count"
                );
            }
        }
        state.num = Some(num);
        state.trigger_state = TriggerState::Preparing;
        Ok(())
    }
}

impl TriggerInfoSource for MockPcompFlyer {
    fn trigger_info(&self) -> Option<TriggerInfo> {
        self.state.lock().num.map(|num| TriggerInfo {
            num,
            trigger: DetectorTrigger::ConstantGate,
            deadtime: self.timing.deadtime,
            livetime: self.timing.livetime,
        })
    }
}

#[async_trait]
impl Kickoffable for MockPcompFlyer {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        let setup = {
            let mut state = self.state.lock();
            if state.trigger_state != TriggerState::Preparing {
                bail!("Trigger logic not prepared (state {})", state.trigger_state);
            }
            let Some(setup) = state.setup else {
                bail!("Position compare not configured");
            };
            state.trigger_state = TriggerState::Starting;
            setup
        };

        self.pulses_tx.send_replace(0);
        let mut position = self.position.clone();
        let geometry = self.geometry;
        let line = self.line.clone();
        let pulses_tx = self.pulses_tx.clone();
        let total = u64::from(setup.pulses);

        let task = tokio::spawn(async move {
            let mut fired = 0u64;
            loop {
                let degrees = *position.borrow_and_update();
                let encoder = geometry.encoder_counts(degrees);
                let progress = match setup.direction {
                    PcompDirection::Negative => setup.start as f64 - encoder,
                    PcompDirection::Positive => encoder - setup.start as f64,
                };
                let due = pulses_due(progress, &setup);
                if due > fired {
                    line.fire(fired, due - fired);
                    fired = due;
                    pulses_tx.send_replace(fired);
                }
                if fired >= total || position.changed().await.is_err() {
                    break;
                }
            }
            tracing::debug!(fired, "MockPanda: position compare finished");
        });
        *self.task.lock() = Some(task);
        Ok(())
    }
}

#[async_trait]
impl Completable for MockPcompFlyer {
    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        let total = {
            let state = self.state.lock();
            match (state.trigger_state, state.setup) {
                (TriggerState::Starting, Some(setup)) => u64::from(setup.pulses),
                (other, _) => bail!("Trigger logic was not kicked off (state {})", other),
            }
        };
        let mut pulses = self.pulses_tx.subscribe();
        if pulses.wait_for(|fired| *fired >= total).await.is_err() {
            bail!("Pulse counter closed before {} pulses", total);
        }
        Ok(())
    }
}

/// Trigger unit bundle: position-compare flyer plus position capture detector.
pub struct MockPanda {
    flyer: Arc<MockPcompFlyer>,
    detector: Arc<MockDetector>,
}

impl MockPanda {
    /// Builder attached to an axis position feed and an output line.
    pub fn builder(position: watch::Receiver<f64>, line: TriggerLine) -> MockPandaBuilder {
        MockPandaBuilder::new(position, line)
    }

    /// Position-compare trigger logic.
    pub fn flyer(&self) -> Arc<MockPcompFlyer> {
        self.flyer.clone()
    }

    /// Position capture with its writer.
    pub fn detector(&self) -> Arc<MockDetector> {
        self.detector.clone()
    }
}

/// Builder for [`MockPanda`].
pub struct MockPandaBuilder {
    position: watch::Receiver<f64>,
    line: TriggerLine,
    geometry: EncoderGeometry,
    timing: PandaTriggerTiming,
    flyer_name: String,
    detector_name: String,
    mode: MockMode,
    flyer_errors: ErrorConfig,
    detector_errors: ErrorConfig,
}

impl MockPandaBuilder {
    fn new(position: watch::Receiver<f64>, line: TriggerLine) -> Self {
        Self {
            position,
            line,
            geometry: EncoderGeometry::default(),
            timing: PandaTriggerTiming::default(),
            flyer_name: "panda_flyer".into(),
            detector_name: "panda_detector".into(),
            mode: MockMode::Instant,
            flyer_errors: ErrorConfig::none(),
            detector_errors: ErrorConfig::none(),
        }
    }

    /// Encoder geometry of the followed axis.
    pub fn geometry(mut self, geometry: EncoderGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Deadtime and livetime reported in trigger info.
    pub fn trigger_timing(mut self, timing: PandaTriggerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Participant names of the flyer and detector.
    pub fn names(mut self, flyer: impl Into<String>, detector: impl Into<String>) -> Self {
        self.flyer_name = flyer.into();
        self.detector_name = detector.into();
        self
    }

    /// Set operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection for the position-compare flyer.
    pub fn flyer_errors(mut self, errors: ErrorConfig) -> Self {
        self.flyer_errors = errors;
        self
    }

    /// Error injection for the capture detector.
    pub fn detector_errors(mut self, errors: ErrorConfig) -> Self {
        self.detector_errors = errors;
        self
    }

    /// Build the unit.
    pub fn build(self) -> MockPanda {
        let (pulses_tx, _) = watch::channel(0);
        let detector = MockDetector::builder(self.detector_name, self.line.clone())
            .mode(self.mode)
            .timing(TimingConfig::trigger_unit())
            .error_config(self.detector_errors)
            .build();
        MockPanda {
            flyer: Arc::new(MockPcompFlyer {
                name: self.flyer_name,
                position: self.position,
                geometry: self.geometry,
                line: self.line,
                timing: self.timing,
                state: Mutex::new(PcompState::default()),
                pulses_tx: Arc::new(pulses_tx),
                task: Mutex::new(None),
                error_config: self.flyer_errors,
            }),
            detector: Arc::new(detector),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_rotary_axis::MockRotaryAxis;
    use flyscan_core::capabilities::Movable;

    fn setup_for(start_deg: f64, pulses: u32) -> PcompSetup {
        let geometry = EncoderGeometry::default();
        PcompSetup {
            start: geometry.encoder_counts(start_deg) as i64,
            step: 20,
            pulses,
            direction: PcompDirection::Negative,
        }
    }

    #[test]
    fn test_pulses_due_counts_crossings() {
        let setup = setup_for(0.0, 11);
        assert_eq!(pulses_due(-5.0, &setup), 0);
        assert_eq!(pulses_due(0.0, &setup), 1);
        assert_eq!(pulses_due(19.9, &setup), 1);
        assert_eq!(pulses_due(20.0, &setup), 2);
        assert_eq!(pulses_due(10_000.0, &setup), 11);
    }

    #[tokio::test]
    async fn test_sweep_fires_every_pulse() {
        let axis = MockRotaryAxis::builder().initial_position(-1.0).build();
        let line = TriggerLine::new("panda_out");
        let mut listener = line.subscribe();
        let panda = MockPanda::builder(axis.subscribe_position(), line).build();
        let flyer = panda.flyer();

        flyer.configure_pcomp(setup_for(0.0, 11)).await.unwrap();
        flyer.stage().await.unwrap();
        flyer.prepare(11).await.unwrap();
        flyer.kickoff().await.unwrap();

        // 10 steps of 0.1 deg
        axis.move_abs(2.0).await.unwrap();
        flyer.complete().await.unwrap();

        assert_eq!(flyer.pulses_fired(), 11);
        let burst = listener.recv().await.unwrap();
        assert_eq!(burst.first, 0);
        assert_eq!(burst.count, 11);
    }

    #[tokio::test]
    async fn test_trigger_info_uses_configured_timing() {
        let axis = MockRotaryAxis::new();
        let panda = MockPanda::builder(axis.subscribe_position(), TriggerLine::new("out"))
            .trigger_timing(PandaTriggerTiming {
                deadtime: 0.0001,
                livetime: 0.05,
            })
            .build();
        let flyer = panda.flyer();
        assert!(flyer.trigger_info().is_none());

        flyer.stage().await.unwrap();
        flyer.prepare(7).await.unwrap();
        let info = flyer.trigger_info().unwrap();
        assert_eq!(info.num, 7);
        assert_eq!(info.trigger, DetectorTrigger::ConstantGate);
        assert_eq!(info.deadtime, 0.0001);
    }

    #[tokio::test]
    async fn test_prepare_requires_stage() {
        let axis = MockRotaryAxis::new();
        let panda = MockPanda::builder(axis.subscribe_position(), TriggerLine::new("out")).build();
        let flyer = panda.flyer();
        assert!(flyer.prepare(3).await.is_err());
        assert_eq!(flyer.trigger_state(), TriggerState::Null);
    }

    #[tokio::test]
    async fn test_kickoff_requires_pcomp_setup() {
        let axis = MockRotaryAxis::new();
        let panda = MockPanda::builder(axis.subscribe_position(), TriggerLine::new("out")).build();
        let flyer = panda.flyer();
        flyer.stage().await.unwrap();
        flyer.prepare(3).await.unwrap();
        assert!(flyer.kickoff().await.is_err());
    }
}
