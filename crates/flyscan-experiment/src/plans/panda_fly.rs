//! Trigger-unit-only capture.
//!
//! Arms the trigger unit and its position capture, then drains captured
//! positions until every pulse has fired. No axis is commanded: the motion
//! comes from elsewhere, and position compare is either loaded here or left
//! as the unit already has it.

use super::{PandaUnit, PlanContext};
use crate::completion::DrainReport;
use crate::coordinator::{LifecycleCoordinator, ParticipantSet};
use flyscan_core::capabilities::PositionCompare;
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase};
use flyscan_core::trigger::PcompSetup;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const COMPLETE_GROUP: &str = "complete";

/// What the trigger unit should capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PandaFlyRequest {
    /// Pulses to fire and positions to capture.
    pub num_pulses: u32,
    /// Position compare to load first; `None` keeps the unit's current one.
    pub pcomp: Option<PcompSetup>,
}

impl Default for PandaFlyRequest {
    fn default() -> Self {
        Self {
            num_pulses: 724,
            pcomp: None,
        }
    }
}

impl PandaFlyRequest {
    fn validate(&self) -> FlyscanResult<()> {
        if self.num_pulses == 0 {
            return Err(FlyscanError::Configuration(
                "At least one pulse is required".into(),
            ));
        }
        if let Some(pcomp) = &self.pcomp {
            if pcomp.pulses != self.num_pulses {
                return Err(FlyscanError::Configuration(format!(
                    "Position compare fires {} pulses but {} were requested",
                    pcomp.pulses, self.num_pulses
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a trigger-unit capture.
#[derive(Debug, Clone, Serialize)]
pub struct PandaFlyReport {
    /// Coordinator run id.
    pub run_id: Uuid,
    /// Positions drained from the capture writer.
    pub frames: u64,
    /// What the drain loop saw.
    pub drain: DrainReport,
}

/// Capture `num_pulses` positions with the trigger unit alone.
pub async fn panda_fly(
    panda: &PandaUnit,
    request: &PandaFlyRequest,
    ctx: &PlanContext,
) -> FlyscanResult<PandaFlyReport> {
    request.validate()?;

    let set = panda.pair.add_to(ParticipantSet::new());
    let mut coordinator = LifecycleCoordinator::new(set, ctx.settings, ctx.abort.clone())?;

    let outcome = async {
        if let Some(pcomp) = request.pcomp {
            coordinator
                .call(panda.pair.flyer_name(), Phase::Setup, panda.pcomp.configure_pcomp(pcomp))
                .await?;
        }
        coordinator.stage_all().await?;
        panda.pair.prepare(&mut coordinator, request.num_pulses).await?;
        coordinator.kickoff_all().await?;
        panda.pair.complete(&mut coordinator, COMPLETE_GROUP)?;
        coordinator
            .drain(COMPLETE_GROUP, &[panda.pair.detector_name()])
            .await
    }
    .await;

    let drain = coordinator.finish(outcome).await?;
    let frames = drain.frames_for(panda.pair.detector_name());
    info!(run_id = %coordinator.run_id(), frames, polls = drain.polls, "Trigger unit capture finished");

    Ok(PandaFlyReport {
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
    use flyscan_core::capabilities::Movable;
    use flyscan_core::limits::EncoderGeometry;
    use flyscan_core::trigger::PcompDirection;
    use flyscan_driver_mock::{MockPanda, MockRotaryAxis, TriggerLine};
    use std::sync::Arc;
    use std::time::Duration;

    fn unit(axis: &MockRotaryAxis) -> (PandaUnit, MockPanda) {
        let panda = MockPanda::builder(axis.subscribe_position(), TriggerLine::new("panda_out")).build();
        let unit = PandaUnit {
            pair: TriggerPair::new::<u32, _, _>(
                "panda_flyer",
                panda.flyer(),
                "panda_detector",
                panda.detector(),
            ),
            pcomp: panda.flyer(),
        };
        (unit, panda)
    }

    fn pcomp(pulses: u32) -> PcompSetup {
        PcompSetup {
            start: EncoderGeometry::default().encoder_counts(0.0) as i64,
            step: 40,
            pulses,
            direction: PcompDirection::Negative,
        }
    }

    fn context() -> PlanContext {
        PlanContext::new(TimingPlanner::default(), DrainSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_captures_positions_while_axis_is_driven_elsewhere() {
        let axis = Arc::new(MockRotaryAxis::builder().initial_position(-1.0).build());
        let (unit, panda) = unit(&axis);

        let mover = axis.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            mover.move_abs(19.0).await
        });

        let request = PandaFlyRequest {
            num_pulses: 91,
            pcomp: Some(pcomp(91)),
        };
        let report = panda_fly(&unit, &request, &context()).await.unwrap();

        assert_eq!(report.frames, 91);
        assert_eq!(panda.flyer().pulses_fired(), 91);
        assert!(!panda.detector().staged());
    }

    #[tokio::test]
    async fn test_mismatched_pulse_count_commands_nothing() {
        let axis = MockRotaryAxis::new();
        let (unit, panda) = unit(&axis);

        let request = PandaFlyRequest {
            num_pulses: 90,
            pcomp: Some(pcomp(91)),
        };
        let err = panda_fly(&unit, &request, &context()).await.unwrap_err();

        assert!(matches!(err, FlyscanError::Configuration(_)));
        assert!(!panda.detector().staged());
        assert_eq!(panda.flyer().pulses_fired(), 0);
    }

    #[tokio::test]
    async fn test_without_position_compare_fails_at_kickoff_and_unstages() {
        let axis = MockRotaryAxis::new();
        let (unit, panda) = unit(&axis);

        let request = PandaFlyRequest {
            num_pulses: 10,
            pcomp: None,
        };
        let err = panda_fly(&unit, &request, &context()).await.unwrap_err();

        match err.primary() {
            FlyscanError::Participant { participant, phase, .. } => {
                assert_eq!(participant, "panda_flyer");
                assert_eq!(*phase, Phase::Kickoff);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!panda.detector().staged());
    }
}
