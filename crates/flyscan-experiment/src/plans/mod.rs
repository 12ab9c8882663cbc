//! Acquisition plans for the tomography endstation.
//!
//! - [`tomo`]: hardware-triggered flyscan of the rotation stage
//! - [`dark_flat`]: software-triggered dark and flat calibration frames
//! - [`panda_fly`]: position capture with the trigger unit alone
//! - [`collect`]: camera frames with either trigger source
//!
//! Plans receive the instrument as capability handles ([`TomoInstrument`])
//! and drive it through a [`LifecycleCoordinator`].

pub mod collect;
pub mod dark_flat;
pub mod panda_fly;
pub mod tomo;

pub use collect::{kinetix_collect, CollectReport, CollectRequest};
pub use dark_flat::{dark_flat, DarkFlatReport, DarkFlatRequest};
pub use panda_fly::{panda_fly, PandaFlyReport, PandaFlyRequest};
pub use tomo::{tomo_flyscan, FlyscanReport};

use crate::abort::AbortSignal;
use crate::completion::DrainSettings;
use crate::coordinator::{LifecycleCoordinator, Participant, ParticipantSet};
use crate::planner::TimingPlanner;
use flyscan_core::capabilities::{
    Acquirer, Collectable, MotionAxis, Movable, PositionCompare, ReadoutModeSource, ShutterControl,
    ShutterStatus, TriggerInfoSource,
};
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase};
use flyscan_core::trigger::TriggerInfo;
use std::sync::Arc;
use tracing::debug;

/// Trigger logic and the detector it drives.
///
/// The trigger logic is prepared with its own setup value and then describes
/// its trigger train; the detector is prepared with that description.
#[derive(Clone)]
pub struct TriggerPair {
    flyer: Participant,
    trigger_info: Arc<dyn TriggerInfoSource>,
    detector: Participant,
}

impl TriggerPair {
    /// Pair trigger logic prepared with `T` with its detector.
    pub fn new<T, F, D>(
        flyer_name: impl Into<String>,
        flyer: Arc<F>,
        detector_name: impl Into<String>,
        detector: Arc<D>,
    ) -> Self
    where
        T: Send + 'static,
        F: Acquirer<T> + TriggerInfoSource + 'static,
        D: Acquirer<TriggerInfo> + Collectable + 'static,
    {
        Self {
            flyer: Participant::acquirer::<T, F>(flyer_name, flyer.clone()),
            trigger_info: flyer,
            detector: Participant::acquirer::<TriggerInfo, D>(detector_name, detector.clone())
                .with_collect(detector),
        }
    }

    /// Trigger logic participant name.
    pub fn flyer_name(&self) -> &str {
        self.flyer.name()
    }

    /// Detector participant name.
    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Add both participants, detector first so it is armed before its
    /// trigger source starts.
    fn add_to(&self, set: ParticipantSet) -> ParticipantSet {
        set.with(self.detector.clone()).with(self.flyer.clone())
    }

    /// Prepare the trigger logic with `setup`, then the detector with the
    /// trigger train it reports.
    async fn prepare<T: Send + 'static>(
        &self,
        coordinator: &mut LifecycleCoordinator,
        setup: T,
    ) -> FlyscanResult<TriggerInfo> {
        coordinator.prepare(self.flyer.name(), setup, true).await?;
        let info = self.trigger_info.trigger_info().ok_or_else(|| {
            FlyscanError::participant(
                self.flyer.name(),
                Phase::Prepare,
                anyhow::anyhow!("no trigger info after prepare"),
            )
        })?;
        debug!(
            flyer = %self.flyer.name(),
            detector = %self.detector.name(),
            num = info.num,
            trigger = %info.trigger,
            deadtime = info.deadtime,
            livetime = info.livetime,
            "Preparing detector from trigger logic"
        );
        coordinator.prepare(self.detector.name(), info, true).await?;
        Ok(info)
    }

    /// Register both completions in `group`.
    fn complete(&self, coordinator: &mut LifecycleCoordinator, group: &str) -> FlyscanResult<()> {
        coordinator.complete(self.flyer.name(), group)?;
        coordinator.complete(self.detector.name(), group)
    }
}

/// Trigger unit: position-compare trigger logic plus its position capture.
#[derive(Clone)]
pub struct PandaUnit {
    /// Trigger logic (prepared with a pulse count) and capture writer.
    pub pair: TriggerPair,
    /// Position-compare block of the trigger logic.
    pub pcomp: Arc<dyn PositionCompare>,
}

/// Area detector: trigger logic, frame writer and readout settings.
#[derive(Clone)]
pub struct CameraUnit {
    /// Trigger logic (prepared with a camera setup) and frame writer.
    pub pair: TriggerPair,
    /// Readout mode, read once per plan.
    pub readout: Arc<dyn ReadoutModeSource>,
}

/// Capability handles of the tomography endstation.
#[derive(Clone)]
pub struct TomoInstrument {
    /// Rotation stage.
    pub rotation: Arc<dyn MotionAxis>,
    /// Front-end shutter, status only.
    pub fe_shutter: Arc<dyn ShutterStatus>,
    /// Endstation shutter.
    pub shutter: Arc<dyn ShutterControl>,
    /// Trigger unit.
    pub panda: PandaUnit,
    /// Camera, when installed.
    pub camera: Option<CameraUnit>,
    /// Sample translation used to move out of the beam for flats.
    pub sample_stage: Option<Arc<dyn Movable>>,
}

pub(crate) const ROTATION: &str = "rotation";
pub(crate) const FE_SHUTTER: &str = "fe_shutter";
pub(crate) const SHUTTER: &str = "shutter";
pub(crate) const SAMPLE_STAGE: &str = "sample_stage";
pub(crate) const CAMERA: &str = "camera";

/// Everything a plan needs besides the instrument.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// Timing planner with the configured limits.
    pub planner: TimingPlanner,
    /// Completion loop timing.
    pub settings: DrainSettings,
    /// Operator abort.
    pub abort: AbortSignal,
}

impl PlanContext {
    /// Context that is never aborted.
    pub fn new(planner: TimingPlanner, settings: DrainSettings) -> Self {
        Self {
            planner,
            settings,
            abort: AbortSignal::never(),
        }
    }

    /// Observe `abort`.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }
}

/// Read the front-end shutter; a closed shutter is a precondition failure.
async fn require_beam(instrument: &TomoInstrument) -> FlyscanResult<()> {
    let open = instrument
        .fe_shutter
        .is_open()
        .await
        .map_err(|e| FlyscanError::participant(FE_SHUTTER, Phase::Setup, e))?;
    if !open {
        return Err(FlyscanError::Precondition(
            "Front-end shutter is closed, open it before scanning".into(),
        ));
    }
    Ok(())
}
