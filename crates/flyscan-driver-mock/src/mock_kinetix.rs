//! Mock scientific camera (Kinetix-like).
//!
//! The camera is a bundle of trigger logic ([`MockCameraFlyer`]) and a
//! [`MockDetector`] writer. In hardware-trigger mode frames follow pulses on
//! the external trigger line; in software mode the flyer generates the
//! pulses itself on the camera's internal line at `livetime + deadtime`
//! intervals.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use crate::mock_detector::MockDetector;
use crate::trigger_line::TriggerLine;
use anyhow::{bail, Result};
use async_trait::async_trait;
use flyscan_core::capabilities::{
    Completable, Kickoffable, Preparable, ReadoutModeSource, Stageable, TriggerInfoSource,
};
use flyscan_core::readout::ReadoutMode;
use flyscan_core::trigger::{CameraTriggerSetup, DetectorTrigger, TriggerInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const DRIVER_TYPE: &str = "mock_kinetix";

#[derive(Default)]
struct CameraFlyerState {
    staged: bool,
    setup: Option<CameraTriggerSetup>,
    kicked_off: bool,
}

/// Trigger logic of the camera.
pub struct MockCameraFlyer {
    name: String,
    internal_line: TriggerLine,
    deadtime: f64,
    default_livetime: f64,
    state: Mutex<CameraFlyerState>,
    generated_tx: Arc<watch::Sender<bool>>,
    generator: Mutex<Option<JoinHandle<()>>>,
    mode: MockMode,
    error_config: ErrorConfig,
}

impl MockCameraFlyer {
    /// Flyer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn abort_generator(&self) {
        if let Some(task) = self.generator.lock().take() {
            task.abort();
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    fn livetime(&self, setup: &CameraTriggerSetup) -> f64 {
        setup.exposure_time.unwrap_or(self.default_livetime)
    }
}

impl Drop for MockCameraFlyer {
    fn drop(&mut self) {
        self.abort_generator();
    }
}

#[async_trait]
impl Stageable for MockCameraFlyer {
    async fn stage(&self) -> Result<()> {
        self.check("stage")?;
        let mut state = self.state.lock();
        if state.staged {
            bail!("{} is already staged", self.name);
        }
        *state = CameraFlyerState {
            staged: true,
            ..Default::default()
        };
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        self.abort_generator();
        *self.state.lock() = CameraFlyerState::default();
        Ok(())
    }

    async fn is_staged(&self) -> Result<bool> {
        Ok(self.state.lock().staged)
    }
}

#[async_trait]
impl Preparable<CameraTriggerSetup> for MockCameraFlyer {
    async fn prepare(&self, setup: CameraTriggerSetup) -> Result<()> {
        self.check("prepare")?;
        if setup.num_images == 0 {
            bail!("{}: cannot prepare for zero images", self.name);
        }
        if let Some(exposure) = setup.exposure_time {
            if !(exposure.is_finite() && exposure > 0.0) {
                bail!("{}: invalid exposure {}", self.name, exposure);
            }
        }
        let mut state = self.state.lock();
        if !state.staged {
            bail!("{} must be staged before prepare", self.name);
        }
        state.setup = Some(setup);
        state.kicked_off = false;
        tracing::debug!(
            flyer = %self.name,
            num_images = setup.num_images,
            software = setup.software_trigger,
            "MockKinetix: trigger logic prepared"
        );
        Ok(())
    }
}

impl TriggerInfoSource for MockCameraFlyer {
    fn trigger_info(&self) -> Option<TriggerInfo> {
        self.state.lock().setup.map(|setup| TriggerInfo {
            num: setup.num_images,
            trigger: if setup.software_trigger {
                DetectorTrigger::Internal
            } else {
                DetectorTrigger::EdgeTrigger
            },
            deadtime: self.deadtime,
            livetime: self.livetime(&setup),
        })
    }
}

#[async_trait]
impl Kickoffable for MockCameraFlyer {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        let setup = {
            let mut state = self.state.lock();
            let Some(setup) = state.setup else {
                bail!("{} must be prepared before kickoff", self.name);
            };
            state.kicked_off = true;
            setup
        };

        if !setup.software_trigger {
            // Frames follow the external line; nothing to generate.
            self.generated_tx.send_replace(true);
            return Ok(());
        }

        self.generated_tx.send_replace(false);
        let line = self.internal_line.clone();
        let generated_tx = self.generated_tx.clone();
        let total = u64::from(setup.num_images);
        let period = if self.mode.is_timed() {
            Duration::from_secs_f64(self.livetime(&setup) + self.deadtime)
        } else {
            Duration::ZERO
        };

        let task = tokio::spawn(async move {
            if period.is_zero() {
                line.fire(0, total);
            } else {
                for index in 0..total {
                    sleep(period).await;
                    line.fire(index, 1);
                }
            }
            generated_tx.send_replace(true);
        });
        *self.generator.lock() = Some(task);
        Ok(())
    }
}

#[async_trait]
impl Completable for MockCameraFlyer {
    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        if !self.state.lock().kicked_off {
            bail!("{} was not kicked off", self.name);
        }
        let mut generated = self.generated_tx.subscribe();
        if generated.wait_for(|done| *done).await.is_err() {
            bail!("{}: pulse generator vanished", self.name);
        }
        Ok(())
    }
}

/// Camera bundle: trigger logic, detector writer and readout settings.
pub struct MockKinetix {
    readout_mode: Mutex<ReadoutMode>,
    flyer: Arc<MockCameraFlyer>,
    detector: Arc<MockDetector>,
    error_config: ErrorConfig,
}

impl MockKinetix {
    /// Builder for a camera triggered from `external_line`.
    pub fn builder(external_line: TriggerLine) -> MockKinetixBuilder {
        MockKinetixBuilder::new(external_line)
    }

    /// Camera trigger logic.
    pub fn flyer(&self) -> Arc<MockCameraFlyer> {
        self.flyer.clone()
    }

    /// Camera detector and writer.
    pub fn detector(&self) -> Arc<MockDetector> {
        self.detector.clone()
    }

    /// Change the readout mode, as an operator would on the camera.
    pub fn set_readout_mode(&self, mode: ReadoutMode) {
        *self.readout_mode.lock() = mode;
    }
}

#[async_trait]
impl ReadoutModeSource for MockKinetix {
    async fn readout_mode(&self) -> Result<ReadoutMode> {
        self.error_config.check_operation(DRIVER_TYPE, "readout_mode")?;
        Ok(*self.readout_mode.lock())
    }
}

/// Builder for [`MockKinetix`].
pub struct MockKinetixBuilder {
    external_line: TriggerLine,
    readout_mode: ReadoutMode,
    deadtime: f64,
    default_livetime: f64,
    flyer_name: String,
    detector_name: String,
    mode: MockMode,
    flyer_errors: ErrorConfig,
    detector_errors: ErrorConfig,
}

impl MockKinetixBuilder {
    fn new(external_line: TriggerLine) -> Self {
        Self {
            external_line,
            readout_mode: ReadoutMode::default(),
            deadtime: 0.001,
            default_livetime: 0.01,
            flyer_name: "kinetix_flyer".into(),
            detector_name: "kinetix_detector".into(),
            mode: MockMode::Instant,
            flyer_errors: ErrorConfig::none(),
            detector_errors: ErrorConfig::none(),
        }
    }

    /// Initial readout mode.
    pub fn readout_mode(mut self, mode: ReadoutMode) -> Self {
        self.readout_mode = mode;
        self
    }

    /// Deadtime reported in trigger info (s).
    pub fn deadtime(mut self, deadtime: f64) -> Self {
        self.deadtime = deadtime;
        self
    }

    /// Livetime used when the exposure is left free (s).
    pub fn default_livetime(mut self, livetime: f64) -> Self {
        self.default_livetime = livetime;
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

    /// Error injection for the trigger logic and readout queries.
    pub fn flyer_errors(mut self, errors: ErrorConfig) -> Self {
        self.flyer_errors = errors;
        self
    }

    /// Error injection for the detector.
    pub fn detector_errors(mut self, errors: ErrorConfig) -> Self {
        self.detector_errors = errors;
        self
    }

    /// Build the camera.
    pub fn build(self) -> MockKinetix {
        let internal_line = TriggerLine::new("kinetix_internal");
        let detector = MockDetector::builder(self.detector_name, self.external_line)
            .internal_line(internal_line.clone())
            .exposes(true)
            .mode(self.mode)
            .timing(TimingConfig::camera())
            .error_config(self.detector_errors)
            .build();
        let (generated_tx, _) = watch::channel(false);
        MockKinetix {
            readout_mode: Mutex::new(self.readout_mode),
            flyer: Arc::new(MockCameraFlyer {
                name: self.flyer_name,
                internal_line,
                deadtime: self.deadtime,
                default_livetime: self.default_livetime,
                state: Mutex::new(CameraFlyerState::default()),
                generated_tx: Arc::new(generated_tx),
                generator: Mutex::new(None),
                mode: self.mode,
                error_config: self.flyer_errors.clone(),
            }),
            detector: Arc::new(detector),
            error_config: self.flyer_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_core::capabilities::Collectable;

    fn software(num_images: u32) -> CameraTriggerSetup {
        CameraTriggerSetup {
            num_images,
            exposure_time: Some(0.05),
            software_trigger: true,
        }
    }

    #[tokio::test]
    async fn test_software_trigger_acquires_without_external_pulses() {
        let kinetix = MockKinetix::builder(TriggerLine::new("external")).build();
        let flyer = kinetix.flyer();
        let detector = kinetix.detector();

        flyer.stage().await.unwrap();
        detector.stage().await.unwrap();
        flyer.prepare(software(20)).await.unwrap();

        let info = flyer.trigger_info().unwrap();
        assert_eq!(info.trigger, DetectorTrigger::Internal);
        assert_eq!(info.livetime, 0.05);
        detector.prepare(info).await.unwrap();

        detector.kickoff().await.unwrap();
        flyer.kickoff().await.unwrap();
        flyer.complete().await.unwrap();
        detector.complete().await.unwrap();

        assert_eq!(detector.captured_count().await.unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_software_trigger_paces_frames() {
        let kinetix = MockKinetix::builder(TriggerLine::new("external"))
            .mode(MockMode::Realistic)
            .deadtime(0.05)
            .build();
        let flyer = kinetix.flyer();
        flyer.stage().await.unwrap();
        flyer
            .prepare(CameraTriggerSetup {
                num_images: 4,
                exposure_time: Some(0.2),
                software_trigger: true,
            })
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        flyer.kickoff().await.unwrap();
        flyer.complete().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_hardware_trigger_reports_edge_trigger() {
        let kinetix = MockKinetix::builder(TriggerLine::new("external"))
            .deadtime(0.0001)
            .build();
        let flyer = kinetix.flyer();
        flyer.stage().await.unwrap();
        flyer
            .prepare(CameraTriggerSetup {
                num_images: 1801,
                exposure_time: None,
                software_trigger: false,
            })
            .await
            .unwrap();

        let info = flyer.trigger_info().unwrap();
        assert_eq!(info.trigger, DetectorTrigger::EdgeTrigger);
        assert_eq!(info.deadtime, 0.0001);
        assert_eq!(info.livetime, 0.01);

        flyer.kickoff().await.unwrap();
        flyer.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_readout_mode_is_reported() {
        let kinetix = MockKinetix::builder(TriggerLine::new("external"))
            .readout_mode(ReadoutMode::Speed)
            .build();
        assert_eq!(kinetix.readout_mode().await.unwrap(), ReadoutMode::Speed);
        kinetix.set_readout_mode(ReadoutMode::DynamicRange);
        assert_eq!(
            kinetix.readout_mode().await.unwrap(),
            ReadoutMode::DynamicRange
        );
    }

    #[tokio::test]
    async fn test_complete_before_kickoff_fails() {
        let kinetix = MockKinetix::builder(TriggerLine::new("external")).build();
        let flyer = kinetix.flyer();
        flyer.stage().await.unwrap();
        flyer.prepare(software(2)).await.unwrap();
        assert!(flyer.complete().await.is_err());
    }
}
