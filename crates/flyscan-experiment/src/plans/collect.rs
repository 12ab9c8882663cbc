//! Plain camera collection.
//!
//! Stages the camera's trigger logic and writer, acquires a fixed number of
//! frames and drains them. Frames are triggered either by the camera itself
//! or by pulses on its trigger input; nothing else on the endstation moves.

use super::{CameraUnit, PlanContext};
use crate::completion::DrainReport;
use crate::coordinator::{LifecycleCoordinator, ParticipantSet};
use flyscan_core::error::{FlyscanError, FlyscanResult};
use flyscan_core::trigger::CameraTriggerSetup;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const COMPLETE_GROUP: &str = "complete";

/// Frames to take and how they are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectRequest {
    /// Frames to acquire.
    pub num_images: u32,
    /// Exposure per frame (s).
    pub exposure_time: f64,
    /// Camera generates its own triggers instead of waiting for pulses.
    pub software_trigger: bool,
}

impl Default for CollectRequest {
    fn default() -> Self {
        Self {
            num_images: 10,
            exposure_time: 0.1,
            software_trigger: true,
        }
    }
}

impl CollectRequest {
    fn validate(&self) -> FlyscanResult<()> {
        if self.num_images == 0 {
            return Err(FlyscanError::Configuration(
                "At least one frame is required".into(),
            ));
        }
        if !(self.exposure_time.is_finite() && self.exposure_time > 0.0) {
            return Err(FlyscanError::Configuration(format!(
                "Exposure time must be positive, got {}",
                self.exposure_time
            )));
        }
        Ok(())
    }
}

/// Outcome of a camera collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    /// Coordinator run id.
    pub run_id: Uuid,
    /// Frames drained from the writer.
    pub frames: u64,
    /// What the drain loop saw.
    pub drain: DrainReport,
}

/// Acquire `num_images` frames with the camera alone.
pub async fn kinetix_collect(
    camera: &CameraUnit,
    request: &CollectRequest,
    ctx: &PlanContext,
) -> FlyscanResult<CollectReport> {
    request.validate()?;

    let set = camera.pair.add_to(ParticipantSet::new());
    let mut coordinator = LifecycleCoordinator::new(set, ctx.settings, ctx.abort.clone())?;

    let outcome = async {
        coordinator.stage_all().await?;
        let setup = CameraTriggerSetup {
            num_images: request.num_images,
            exposure_time: Some(request.exposure_time),
            software_trigger: request.software_trigger,
        };
        camera.pair.prepare(&mut coordinator, setup).await?;
        coordinator.kickoff_all().await?;
        camera.pair.complete(&mut coordinator, COMPLETE_GROUP)?;
        coordinator
            .drain(COMPLETE_GROUP, &[camera.pair.detector_name()])
            .await
    }
    .await;

    let drain = coordinator.finish(outcome).await?;
    let frames = drain.frames_for(camera.pair.detector_name());
    info!(
        run_id = %coordinator.run_id(),
        frames,
        software_trigger = request.software_trigger,
        "Camera collection finished"
    );

    Ok(CollectReport {
        run_id: coordinator.run_id(),
        frames,
        drain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::DrainSettings;
    use crate::planner::TimingPlanner;
    use crate::plans::TriggerPair;
    use flyscan_driver_mock::{MockKinetix, TriggerLine};
    use std::sync::Arc;
    use std::time::Duration;

    fn camera(line: &TriggerLine) -> (CameraUnit, Arc<MockKinetix>) {
        let kinetix = Arc::new(MockKinetix::builder(line.clone()).build());
        let unit = CameraUnit {
            pair: TriggerPair::new::<CameraTriggerSetup, _, _>(
                "kinetix_flyer",
                kinetix.flyer(),
                "kinetix_detector",
                kinetix.detector(),
            ),
            readout: kinetix.clone(),
        };
        (unit, kinetix)
    }

    fn context() -> PlanContext {
        PlanContext::new(TimingPlanner::default(), DrainSettings::default())
    }

    #[tokio::test]
    async fn test_software_triggered_collection() {
        let (camera, kinetix) = camera(&TriggerLine::new("unused"));

        let report = kinetix_collect(&camera, &CollectRequest::default(), &context())
            .await
            .unwrap();

        assert_eq!(report.frames, 10);
        assert_eq!(kinetix.detector().captured_frames(), 10);
        assert!(!kinetix.detector().staged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_triggered_collection_follows_trigger_input() {
        let line = TriggerLine::new("trigger_in");
        let (camera, kinetix) = camera(&line);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            line.fire(0, 5);
        });

        let request = CollectRequest {
            num_images: 5,
            exposure_time: 0.01,
            software_trigger: false,
        };
        let report = kinetix_collect(&camera, &request, &context()).await.unwrap();

        assert_eq!(report.frames, 5);
        assert!(!kinetix.detector().staged());
    }

    #[tokio::test]
    async fn test_invalid_request_commands_nothing() {
        let (camera, kinetix) = camera(&TriggerLine::new("unused"));
        let request = CollectRequest {
            exposure_time: 0.0,
            ..CollectRequest::default()
        };

        let err = kinetix_collect(&camera, &request, &context()).await.unwrap_err();
        assert!(matches!(err, FlyscanError::Configuration(_)));
        assert_eq!(kinetix.detector().captured_frames(), 0);
    }
}
