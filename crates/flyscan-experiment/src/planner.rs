//! Flyscan timing planner.
//!
//! Turns a [`ScanTimingSpec`] into a [`TriggerSchedule`]: rotation velocity,
//! time between triggers, encoder pulse geometry and the run-up/run-out
//! positions. Planning is pure and finishes before any hardware is commanded;
//! every infeasible request is reported as [`FlyscanError::Configuration`].
//!
//! # Algorithm
//!
//! 1. Validate the request (`num_images >= 2`, positive exposure, non-zero range).
//! 2. Duration is the requested scan time, or `(n - 1) * (exposure + overhead)`.
//! 3. Velocity is `|range| / duration`; above the scan ceiling it is capped and
//!    the duration recomputed from the capped velocity.
//! 4. `step_time = duration / (n - 1)`.
//! 5. If `1 / step_time` exceeds the camera's frame-rate ceiling for the
//!    current readout mode, the step widens to `1 / max_fps`. Duration and
//!    velocity keep their values from steps 2 and 3.
//! 6. The exposure must fit in one step.
//! 7. Encoder counts per pulse must be an integer.

use flyscan_core::capabilities::ReadoutModeSource;
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase};
use flyscan_core::limits::{is_integral, EncoderGeometry, VelocityLimits, INTEGER_TOLERANCE};
use flyscan_core::readout::{FramerateTable, ReadoutMode};
use flyscan_core::timing::{ScanTimingSpec, TriggerSchedule};
use flyscan_core::trigger::PcompDirection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Readout time assumed between frames when the duration is derived from
/// the exposure (s).
pub const DEFAULT_READOUT_OVERHEAD: f64 = 0.001;

/// Hardware limits the planner works within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerLimits {
    /// Rotation velocity ceilings.
    pub velocity: VelocityLimits,
    /// Rotation encoder geometry.
    pub geometry: EncoderGeometry,
    /// Per-frame readout overhead used when no scan time is given (s).
    pub readout_overhead: f64,
    /// Tolerance for the integer counts-per-pulse check.
    pub integer_tolerance: f64,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            velocity: VelocityLimits::default(),
            geometry: EncoderGeometry::default(),
            readout_overhead: DEFAULT_READOUT_OVERHEAD,
            integer_tolerance: INTEGER_TOLERANCE,
        }
    }
}

/// Plan a flyscan for a camera in `readout_mode`.
pub fn plan(
    spec: &ScanTimingSpec,
    limits: &PlannerLimits,
    framerates: &FramerateTable,
    readout_mode: ReadoutMode,
) -> FlyscanResult<TriggerSchedule> {
    validate(spec)?;

    let mut reset_speed = spec.reset_speed;
    if reset_speed > limits.velocity.reset_max {
        warn!(
            requested = reset_speed,
            max = limits.velocity.reset_max,
            "Reset speed above ceiling, clamping"
        );
        reset_speed = limits.velocity.reset_max;
    }

    let intervals = f64::from(spec.num_images - 1);
    let range = spec.angular_range();
    let span = range.abs();

    let mut duration = match (spec.scan_time, spec.exposure_time) {
        (Some(scan_time), _) => scan_time,
        (None, Some(exposure)) => intervals * (exposure + limits.readout_overhead),
        (None, None) => {
            return Err(FlyscanError::Configuration(
                "Either an exposure time or a scan time is required".into(),
            ))
        }
    };

    let mut velocity = span / duration;
    let mut velocity_clamped = false;
    if velocity > limits.velocity.scan_max {
        warn!(
            requested = velocity,
            max = limits.velocity.scan_max,
            "Rotation velocity above scan ceiling, slowing the sweep"
        );
        velocity = limits.velocity.scan_max;
        duration = span / velocity;
        velocity_clamped = true;
    }

    let mut step_time = duration / intervals;

    let max_framerate = framerates.max_for(readout_mode);
    let mut step_widened = false;
    if 1.0 / step_time > max_framerate {
        let widened = 1.0 / max_framerate;
        warn!(
            step_time,
            widened,
            readout_mode = %readout_mode,
            max_framerate,
            "Trigger rate above camera ceiling, widening step time"
        );
        step_time = widened;
        step_widened = true;
    }

    if let Some(exposure) = spec.exposure_time {
        if exposure > step_time {
            return Err(FlyscanError::Configuration(format!(
                "Exposure time {} s is longer than the time per step {:.6} s",
                exposure, step_time
            )));
        }
    }

    let counts = limits.geometry.counts_per_pulse(span, spec.num_images);
    if !is_integral(counts, limits.integer_tolerance) {
        return Err(FlyscanError::Configuration(format!(
            "The number of encoder counts per pulse is not an integer value ({:.6})",
            counts
        )));
    }
    let step_counts = counts.round() as u64;
    if step_counts == 0 {
        return Err(FlyscanError::Configuration(format!(
            "{} images over {} deg leave less than one encoder count per pulse",
            spec.num_images, span
        )));
    }

    let sign = range.signum();
    let schedule = TriggerSchedule {
        step_time,
        pulse_width: spec.exposure_time.unwrap_or(step_time / 2.0),
        pulse_count: spec.num_images,
        start_position: limits.geometry.encoder_counts(spec.start_angle).round() as i64,
        step_counts,
        // The encoder counts down while the angle increases.
        direction: if sign > 0.0 {
            PcompDirection::Negative
        } else {
            PcompDirection::Positive
        },
        velocity,
        duration,
        reset_speed,
        exposure_time: spec.exposure_time,
        readout_mode,
        max_framerate,
        run_up_position: spec.start_angle - spec.lead_angle * sign,
        run_out_position: spec.stop_angle + spec.lead_angle * sign,
        velocity_clamped,
        step_widened,
    };
    debug!(
        step_time = schedule.step_time,
        velocity = schedule.velocity,
        duration = schedule.duration,
        step_counts = schedule.step_counts,
        "Planned flyscan"
    );
    Ok(schedule)
}

fn validate(spec: &ScanTimingSpec) -> FlyscanResult<()> {
    let invalid = |msg: String| Err(FlyscanError::Configuration(msg));

    if spec.num_images < 2 {
        return invalid(format!(
            "At least 2 images are required, got {}",
            spec.num_images
        ));
    }
    if let Some(exposure) = spec.exposure_time {
        if !(exposure.is_finite() && exposure > 0.0) {
            return invalid(format!("Exposure time must be positive, got {}", exposure));
        }
    }
    if let Some(scan_time) = spec.scan_time {
        if !(scan_time.is_finite() && scan_time > 0.0) {
            return invalid(format!("Scan time must be positive, got {}", scan_time));
        }
    }
    let range = spec.angular_range();
    if !range.is_finite() || range == 0.0 {
        return invalid(format!(
            "Start ({}) and stop ({}) angles must differ",
            spec.start_angle, spec.stop_angle
        ));
    }
    if !(spec.lead_angle.is_finite() && spec.lead_angle >= 0.0) {
        return invalid(format!(
            "Lead angle must be non-negative, got {}",
            spec.lead_angle
        ));
    }
    if !(spec.reset_speed.is_finite() && spec.reset_speed > 0.0) {
        return invalid(format!(
            "Reset speed must be positive, got {}",
            spec.reset_speed
        ));
    }
    Ok(())
}

/// Planner bound to a set of limits and frame-rate ceilings.
#[derive(Debug, Clone, Default)]
pub struct TimingPlanner {
    limits: PlannerLimits,
    framerates: FramerateTable,
}

impl TimingPlanner {
    /// Create a planner.
    pub fn new(limits: PlannerLimits, framerates: FramerateTable) -> Self {
        Self { limits, framerates }
    }

    /// Limits in use.
    pub fn limits(&self) -> &PlannerLimits {
        &self.limits
    }

    /// Plan for a known readout mode.
    pub fn plan(
        &self,
        spec: &ScanTimingSpec,
        readout_mode: ReadoutMode,
    ) -> FlyscanResult<TriggerSchedule> {
        plan(spec, &self.limits, &self.framerates, readout_mode)
    }

    /// Read the readout mode from the camera, then plan.
    ///
    /// The mode read is the only hardware access; nothing is commanded.
    pub async fn plan_for_camera(
        &self,
        spec: &ScanTimingSpec,
        camera: &str,
        source: &dyn ReadoutModeSource,
    ) -> FlyscanResult<TriggerSchedule> {
        let mode = source
            .readout_mode()
            .await
            .map_err(|e| FlyscanError::participant(camera, Phase::Setup, e))?;
        debug!(camera, readout_mode = %mode, "Read camera readout mode");
        self.plan(spec, mode)
    }
}
