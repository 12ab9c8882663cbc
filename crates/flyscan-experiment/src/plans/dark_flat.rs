//! Software-triggered dark and flat calibration frames.
//!
//! Darks are taken with the endstation shutter closed. Flats are taken with
//! beam on the detector and the sample moved out of the field of view by a
//! fixed offset; the sample returns to its starting position afterwards on
//! every exit path.
//!
//! The scan id of a successful acquisition is recorded in the session so
//! projection scans can link to their calibration.

use super::{require_beam, PlanContext, TomoInstrument, SAMPLE_STAGE, SHUTTER};
use crate::coordinator::{LifecycleCoordinator, ParticipantSet};
use flyscan_core::capabilities::{Movable, ShutterControl, ShutterStatus};
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase};
use flyscan_core::session::{FrameType, SessionContext};
use flyscan_core::trigger::CameraTriggerSetup;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

const COLLECT_GROUP: &str = "collect";

/// What to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DarkFlatRequest {
    /// `Dark` or `Flat`.
    pub frame_type: FrameType,
    /// Frames to take.
    pub num_images: u32,
    /// Exposure per frame (s).
    pub exposure_time: f64,
    /// Sample stage offset for flats.
    pub sample_offset: f64,
}

impl DarkFlatRequest {
    /// Request `num_images` dark frames.
    pub fn dark(num_images: u32, exposure_time: f64) -> Self {
        Self {
            frame_type: FrameType::Dark,
            num_images,
            exposure_time,
            sample_offset: 0.0,
        }
    }

    /// Request `num_images` flat frames with the sample moved by `sample_offset`.
    pub fn flat(num_images: u32, exposure_time: f64, sample_offset: f64) -> Self {
        Self {
            frame_type: FrameType::Flat,
            num_images,
            exposure_time,
            sample_offset,
        }
    }

    fn validate(&self) -> FlyscanResult<()> {
        if self.frame_type == FrameType::Projection {
            return Err(FlyscanError::Configuration(
                "Projections are taken by the flyscan, not as calibration frames".into(),
            ));
        }
        if self.num_images == 0 {
            return Err(FlyscanError::Configuration(
                "At least one calibration frame is required".into(),
            ));
        }
        if !(self.exposure_time.is_finite() && self.exposure_time > 0.0) {
            return Err(FlyscanError::Configuration(format!(
                "Exposure time must be positive, got {}",
                self.exposure_time
            )));
        }
        let offset_ok = self.sample_offset.is_finite() && self.sample_offset != 0.0;
        if self.frame_type == FrameType::Flat && !offset_ok {
            return Err(FlyscanError::Configuration(format!(
                "Flat frames need a non-zero sample offset, got {}",
                self.sample_offset
            )));
        }
        Ok(())
    }
}

/// Outcome of a calibration acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DarkFlatReport {
    /// Scan id allocated from the session.
    pub scan_id: u64,
    /// Frame type acquired.
    pub frame_type: FrameType,
    /// Directory the writer was pointed at.
    pub resource_dir: PathBuf,
    /// File prefix of this acquisition.
    pub file_prefix: String,
    /// Frames drained from the writer.
    pub frames: u64,
}

/// Acquire dark or flat frames with a software-triggered camera.
pub async fn dark_flat(
    instrument: &TomoInstrument,
    request: &DarkFlatRequest,
    ctx: &PlanContext,
    session: &mut SessionContext,
) -> FlyscanResult<DarkFlatReport> {
    request.validate()?;
    let Some(camera) = &instrument.camera else {
        return Err(FlyscanError::Precondition(
            "Calibration frames need a camera".into(),
        ));
    };

    match request.frame_type {
        FrameType::Flat => {
            require_beam(instrument).await?;
            if instrument.sample_stage.is_none() {
                return Err(FlyscanError::Precondition(
                    "Flat frames need a sample stage to move out of the beam".into(),
                ));
            }
        }
        _ => {
            // Darks close the shutter before anything else happens
            ctx.abort.check()?;
            instrument
                .shutter
                .close()
                .await
                .map_err(|e| FlyscanError::participant(SHUTTER, Phase::Setup, e))?;
            let open = instrument
                .shutter
                .is_open()
                .await
                .map_err(|e| FlyscanError::participant(SHUTTER, Phase::Setup, e))?;
            if open {
                return Err(FlyscanError::Precondition(
                    "Shutter still open, cannot take dark frames".into(),
                ));
            }
        }
    }

    let scan_id = session.next_scan_id();
    let resource_dir = SessionContext::resource_dir(scan_id, request.frame_type);
    let file_prefix = SessionContext::file_prefix(request.frame_type);
    info!(
        scan = %SessionContext::scan_label(scan_id),
        frame_type = %request.frame_type,
        num_images = request.num_images,
        exposure = request.exposure_time,
        dir = %resource_dir.display(),
        "Collecting calibration frames"
    );

    let set = camera.pair.add_to(ParticipantSet::new());
    let mut coordinator = LifecycleCoordinator::new(set, ctx.settings, ctx.abort.clone())?;

    let outcome = async {
        if let (FrameType::Flat, Some(stage)) = (request.frame_type, &instrument.sample_stage) {
            let home = coordinator
                .call(SAMPLE_STAGE, Phase::Setup, stage.position())
                .await?;
            let back = stage.clone();
            coordinator.register_finalizer(
                "return_sample",
                Box::new(move || {
                    async move {
                        back.move_abs(home).await?;
                        back.wait_settled().await
                    }
                    .boxed()
                }),
            );
            let shutter = instrument.shutter.clone();
            coordinator.register_finalizer(
                "close_shutter",
                Box::new(move || async move { shutter.close().await }.boxed()),
            );

            coordinator
                .call(SAMPLE_STAGE, Phase::Setup, stage.move_abs(home + request.sample_offset))
                .await?;
            coordinator
                .call(SAMPLE_STAGE, Phase::Setup, stage.wait_settled())
                .await?;
            coordinator
                .call(SHUTTER, Phase::Setup, instrument.shutter.open())
                .await?;
        }

        coordinator.stage_all().await?;
        let setup = CameraTriggerSetup {
            num_images: request.num_images,
            exposure_time: Some(request.exposure_time),
            software_trigger: true,
        };
        camera.pair.prepare(&mut coordinator, setup).await?;
        coordinator.kickoff_all().await?;
        camera.pair.complete(&mut coordinator, COLLECT_GROUP)?;
        coordinator
            .drain(COLLECT_GROUP, &[camera.pair.detector_name()])
            .await
    }
    .await;

    let drain = coordinator.finish(outcome).await?;
    session.record_calibration(request.frame_type, scan_id);

    Ok(DarkFlatReport {
        scan_id,
        frame_type: request.frame_type,
        resource_dir,
        file_prefix,
        frames: drain.frames_for(camera.pair.detector_name()),
    })
}
