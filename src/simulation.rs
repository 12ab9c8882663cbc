//! Simulated tomography endstation
//!
//! Wires the mock rotation stage, trigger unit, camera and shutters into a
//! [`TomoInstrument`] according to [`DevicesConfig`]. The CLI runs every plan
//! against this endstation; a beamline deployment swaps in real device
//! layers behind the same capability traits.

use crate::config::{DevicesConfig, FlyscanConfig};
use flyscan_core::trigger::CameraTriggerSetup;
use flyscan_driver_mock::{
    MockDetector, MockKinetix, MockPanda, MockRotaryAxis, MockShutter, TriggerLine,
};
use flyscan_experiment::{CameraUnit, PandaUnit, PlanContext, TimingPlanner, TomoInstrument, TriggerPair};
use std::sync::Arc;
use tracing::info;

/// Name of the trigger line from the trigger unit to the camera.
const PANDA_OUT: &str = "panda_out";

/// A simulated endstation plus handles for inspecting it afterwards.
pub struct SimulatedEndstation {
    /// The instrument handed to plans.
    pub instrument: TomoInstrument,
    /// Rotation stage.
    pub rotation: Arc<MockRotaryAxis>,
    /// Endstation shutter.
    pub shutter: Arc<MockShutter>,
    /// Trigger unit position capture.
    pub panda_detector: Arc<MockDetector>,
    /// Camera writer, when a camera is installed.
    pub camera_detector: Option<Arc<MockDetector>>,
}

impl SimulatedEndstation {
    /// Build the endstation described by `config`.
    pub fn from_config(config: &FlyscanConfig) -> Self {
        let devices: &DevicesConfig = &config.devices;
        let mode = devices.mode;

        let rotation = Arc::new(MockRotaryAxis::builder().mode(mode).build());
        let line = TriggerLine::new(PANDA_OUT);
        let panda = MockPanda::builder(rotation.subscribe_position(), line.clone())
            .geometry(config.limits.geometry)
            .trigger_timing(devices.panda)
            .mode(mode)
            .build();
        let panda_flyer = panda.flyer();
        let panda_detector = panda.detector();

        let (camera, camera_detector) = if devices.camera_present {
            let kinetix = Arc::new(
                MockKinetix::builder(line)
                    .readout_mode(devices.readout_mode)
                    .deadtime(devices.camera_deadtime)
                    .default_livetime(devices.camera_default_livetime)
                    .mode(mode)
                    .build(),
            );
            let flyer = kinetix.flyer();
            let detector = kinetix.detector();
            let unit = CameraUnit {
                pair: TriggerPair::new::<CameraTriggerSetup, _, _>(
                    flyer.name().to_string(),
                    flyer.clone(),
                    detector.name().to_string(),
                    detector.clone(),
                ),
                readout: kinetix,
            };
            (Some(unit), Some(detector))
        } else {
            (None, None)
        };

        let shutter = Arc::new(MockShutter::new("shutter").with_mode(mode));
        let fe_shutter = Arc::new(MockShutter::new("fe_shutter").with_open(devices.fe_shutter_open));
        let sample_stage = Arc::new(MockRotaryAxis::builder().mode(mode).build());

        info!(
            mode = ?mode,
            camera = devices.camera_present,
            readout_mode = %devices.readout_mode,
            "Simulated endstation ready"
        );

        let instrument = TomoInstrument {
            rotation: rotation.clone(),
            fe_shutter,
            shutter: shutter.clone(),
            panda: PandaUnit {
                pair: TriggerPair::new::<u32, _, _>(
                    panda_flyer.name().to_string(),
                    panda_flyer.clone(),
                    panda_detector.name().to_string(),
                    panda_detector.clone(),
                ),
                pcomp: panda_flyer,
            },
            camera,
            sample_stage: Some(sample_stage),
        };

        Self {
            instrument,
            rotation,
            shutter,
            panda_detector,
            camera_detector,
        }
    }
}

/// Plan context from the configured limits and loop timing.
pub fn plan_context(config: &FlyscanConfig) -> PlanContext {
    PlanContext::new(
        TimingPlanner::new(config.limits, config.framerates),
        config.coordinator,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_driver_mock::MockMode;

    fn instant_config() -> FlyscanConfig {
        let mut config = FlyscanConfig::default();
        config.devices.mode = MockMode::Instant;
        config
    }

    #[test]
    fn test_camera_follows_config() {
        let station = SimulatedEndstation::from_config(&instant_config());
        let camera = station.instrument.camera.as_ref().unwrap();
        assert_eq!(camera.pair.flyer_name(), "kinetix_flyer");
        assert_eq!(camera.pair.detector_name(), "kinetix_detector");
        assert_eq!(station.instrument.panda.pair.detector_name(), "panda_detector");

        let mut config = instant_config();
        config.devices.camera_present = false;
        let station = SimulatedEndstation::from_config(&config);
        assert!(station.instrument.camera.is_none());
        assert!(station.camera_detector.is_none());
    }
}
