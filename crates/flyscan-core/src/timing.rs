//! Scan timing inputs and the trigger schedule derived from them.

use crate::readout::ReadoutMode;
use crate::trigger::{PcompDirection, PcompSetup};
use serde::{Deserialize, Serialize};

/// Operator-facing timing request for one flyscan.
///
/// Consumed once per scan invocation by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanTimingSpec {
    /// Exposure per frame (s). `None` leaves the camera free running.
    pub exposure_time: Option<f64>,
    /// Number of images / angles.
    pub num_images: u32,
    /// First projection angle (deg).
    pub start_angle: f64,
    /// Last projection angle (deg).
    pub stop_angle: f64,
    /// Run-up and run-out margin around the active range (deg).
    pub lead_angle: f64,
    /// Speed for moves outside the active range (deg/s).
    pub reset_speed: f64,
    /// Time to sweep the active range (s). Derived from exposure when `None`.
    pub scan_time: Option<f64>,
}

impl Default for ScanTimingSpec {
    fn default() -> Self {
        Self {
            exposure_time: Some(0.015),
            num_images: 1801,
            start_angle: 0.0,
            stop_angle: 180.0,
            lead_angle: 10.0,
            reset_speed: 30.0,
            scan_time: Some(20.0),
        }
    }
}

impl ScanTimingSpec {
    /// Signed angular range of the active sweep.
    pub fn angular_range(&self) -> f64 {
        self.stop_angle - self.start_angle
    }

    /// Set the exposure time.
    pub fn with_exposure(mut self, exposure_time: Option<f64>) -> Self {
        self.exposure_time = exposure_time;
        self
    }

    /// Set the number of images.
    pub fn with_num_images(mut self, num_images: u32) -> Self {
        self.num_images = num_images;
        self
    }

    /// Set start and stop angles.
    pub fn with_range(mut self, start_angle: f64, stop_angle: f64) -> Self {
        self.start_angle = start_angle;
        self.stop_angle = stop_angle;
        self
    }

    /// Set the lead angle.
    pub fn with_lead_angle(mut self, lead_angle: f64) -> Self {
        self.lead_angle = lead_angle;
        self
    }

    /// Set the reset speed.
    pub fn with_reset_speed(mut self, reset_speed: f64) -> Self {
        self.reset_speed = reset_speed;
        self
    }

    /// Set or clear a fixed scan time.
    pub fn with_scan_time(mut self, scan_time: Option<f64>) -> Self {
        self.scan_time = scan_time;
        self
    }
}

/// Output of planning: everything needed to arm motion, trigger unit and camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSchedule {
    /// Time between triggers (s).
    pub step_time: f64,
    /// Trigger pulse width (s).
    pub pulse_width: f64,
    /// Number of trigger pulses.
    pub pulse_count: u32,
    /// Encoder position of the first pulse.
    pub start_position: i64,
    /// Encoder counts between pulses.
    pub step_counts: u64,
    /// Direction of encoder travel during the sweep.
    pub direction: PcompDirection,
    /// Rotation speed during the sweep (deg/s).
    pub velocity: f64,
    /// Time to sweep the active range (s).
    pub duration: f64,
    /// Speed for moves outside the active range, after clamping (deg/s).
    pub reset_speed: f64,
    /// Exposure per frame (s).
    pub exposure_time: Option<f64>,
    /// Readout mode the schedule was planned for.
    pub readout_mode: ReadoutMode,
    /// Frame-rate ceiling of that readout mode (fps).
    pub max_framerate: f64,
    /// Where the axis waits before the sweep (deg).
    pub run_up_position: f64,
    /// Where the sweep ends, lead angle included (deg).
    pub run_out_position: f64,
    /// Velocity was capped at the scan ceiling.
    pub velocity_clamped: bool,
    /// Step time was widened to respect the camera frame-rate ceiling.
    pub step_widened: bool,
}

impl TriggerSchedule {
    /// Position-compare block setup for this schedule.
    pub fn pcomp_setup(&self) -> PcompSetup {
        PcompSetup {
            start: self.start_position,
            step: self.step_counts,
            pulses: self.pulse_count,
            direction: self.direction,
        }
    }

    /// Trigger rate implied by the step time (Hz).
    pub fn framerate(&self) -> f64 {
        1.0 / self.step_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_half_turn() {
        let spec = ScanTimingSpec::default();
        assert_eq!(spec.angular_range(), 180.0);
        assert_eq!(spec.num_images, 1801);
    }

    #[test]
    fn test_builder_overrides() {
        let spec = ScanTimingSpec::default()
            .with_range(10.0, 40.0)
            .with_num_images(301)
            .with_exposure(None)
            .with_scan_time(None);

        assert_eq!(spec.angular_range(), 30.0);
        assert_eq!(spec.num_images, 301);
        assert!(spec.exposure_time.is_none());
        assert!(spec.scan_time.is_none());
    }
}
