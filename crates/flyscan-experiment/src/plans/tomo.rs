//! Hardware-triggered tomography flyscan.
//!
//! The rotation stage sweeps from `start - lead` to `stop + lead` at the
//! planned velocity. The trigger unit fires one pulse every `step_counts`
//! encoder counts inside the active range; the camera exposes on each pulse
//! and the trigger unit captures the encoder position alongside.
//!
//! Sequence:
//! 1. front-end shutter must be open
//! 2. plan the timing for the camera's readout mode
//! 3. reset velocity, move to run-up, scan velocity
//! 4. configure position compare
//! 5. stage everything, open the endstation shutter
//! 6. prepare camera trigger logic and writer, then trigger unit and capture
//! 7. kick off, then start the sweep
//! 8. wait for everything in one completion group while draining both writers
//! 9. unstage; close the shutter and restore the reset velocity

use super::{require_beam, PlanContext, TomoInstrument, CAMERA, ROTATION, SHUTTER};
use crate::completion::DrainReport;
use crate::coordinator::{LifecycleCoordinator, ParticipantSet};
use flyscan_core::capabilities::{PositionCompare, ShutterControl};
use flyscan_core::error::{FlyscanResult, Phase};
use flyscan_core::readout::ReadoutMode;
use flyscan_core::session::SessionContext;
use flyscan_core::timing::{ScanTimingSpec, TriggerSchedule};
use flyscan_core::trigger::CameraTriggerSetup;
use futures::FutureExt;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Completion group for the sweep and every acquirer.
pub const COMPLETE_GROUP: &str = "complete";

/// Outcome of a successful flyscan.
#[derive(Debug, Clone, Serialize)]
pub struct FlyscanReport {
    /// Scan id allocated from the session.
    pub scan_id: u64,
    /// Coordinator run id.
    pub run_id: Uuid,
    /// Schedule the scan ran with.
    pub schedule: TriggerSchedule,
    /// What the drain loop saw.
    pub drain: DrainReport,
}

impl FlyscanReport {
    /// Whether camera frames and captured positions agree.
    pub fn counts_agree(&self) -> bool {
        self.drain.counts_agree()
    }
}

/// Run a tomography flyscan.
///
/// Planning and the shutter precondition are checked before any hardware is
/// commanded. The scan id is taken from `session` once planning succeeds.
pub async fn tomo_flyscan(
    instrument: &TomoInstrument,
    spec: &ScanTimingSpec,
    ctx: &PlanContext,
    session: &mut SessionContext,
) -> FlyscanResult<FlyscanReport> {
    require_beam(instrument).await?;

    let schedule = match &instrument.camera {
        Some(camera) => {
            ctx.planner
                .plan_for_camera(spec, camera.pair.flyer_name(), camera.readout.as_ref())
                .await?
        }
        None => {
            warn!("No camera installed, planning for the default readout mode");
            ctx.planner.plan(spec, ReadoutMode::default())?
        }
    };
    let scan_id = session.next_scan_id();
    info!(
        scan = %SessionContext::scan_label(scan_id),
        velocity = schedule.velocity,
        step_time = schedule.step_time,
        step_counts = schedule.step_counts,
        pulses = schedule.pulse_count,
        readout_mode = %schedule.readout_mode,
        "Flyscan planned"
    );

    let set = match &instrument.camera {
        Some(camera) => camera.pair.add_to(ParticipantSet::new()),
        None => ParticipantSet::new().with_absent(CAMERA),
    };
    let set = instrument.panda.pair.add_to(set);
    let mut coordinator = LifecycleCoordinator::new(set, ctx.settings, ctx.abort.clone())?;

    let shutter = instrument.shutter.clone();
    coordinator.register_finalizer(
        "close_shutter",
        Box::new(move || async move { shutter.close().await }.boxed()),
    );

    let outcome = async {
        coordinator
            .prepare_motion(ROTATION, instrument.rotation.clone(), &schedule)
            .await?;
        coordinator
            .call(
                instrument.panda.pair.flyer_name(),
                Phase::Setup,
                instrument.panda.pcomp.configure_pcomp(schedule.pcomp_setup()),
            )
            .await?;

        coordinator.stage_all().await?;
        coordinator
            .call(SHUTTER, Phase::Setup, instrument.shutter.open())
            .await?;

        if let Some(camera) = &instrument.camera {
            let setup = CameraTriggerSetup {
                num_images: schedule.pulse_count,
                exposure_time: schedule.exposure_time,
                software_trigger: false,
            };
            camera.pair.prepare(&mut coordinator, setup).await?;
        }
        instrument
            .panda
            .pair
            .prepare(&mut coordinator, schedule.pulse_count)
            .await?;

        coordinator.kickoff_all().await?;

        instrument.panda.pair.complete(&mut coordinator, COMPLETE_GROUP)?;
        let mut collectors = vec![instrument.panda.pair.detector_name()];
        if let Some(camera) = &instrument.camera {
            camera.pair.complete(&mut coordinator, COMPLETE_GROUP)?;
            collectors.push(camera.pair.detector_name());
        }
        coordinator.complete_motion(COMPLETE_GROUP)?;

        coordinator.drain(COMPLETE_GROUP, &collectors).await
    }
    .await;

    let drain = coordinator.finish(outcome).await?;
    info!(
        scan = %SessionContext::scan_label(scan_id),
        polls = drain.polls,
        frames = ?drain.frames,
        "Flyscan finished"
    );

    Ok(FlyscanReport {
        scan_id,
        run_id: coordinator.run_id(),
        schedule,
        drain,
    })
}
