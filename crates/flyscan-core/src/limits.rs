//! Beamline constants and hard limits for the tomography rotation stage.
//!
//! This module centralizes:
//! - Encoder geometry of the rotary stage (counts per revolution, zero offset)
//! - Velocity ceilings for reset moves and scan moves
//! - Default completion-loop timing
//!
//! [`EncoderGeometry`] and [`VelocityLimits`] carry the same values as runtime
//! configuration so a different stage can be described without recompiling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Encoder Geometry
// =============================================================================

/// Encoder counts for one full revolution of the rotary stage.
pub const COUNTS_PER_REVOLUTION: f64 = 72_000.0;

/// Degrees per revolution.
pub const DEG_PER_REVOLUTION: f64 = 360.0;

/// Encoder counts per degree (`COUNTS_PER_REVOLUTION / DEG_PER_REVOLUTION`).
pub const COUNTS_PER_DEG: f64 = 200.0;

/// Encoder reading at 0 degrees, in counts.
pub const ZERO_OFFSET: f64 = 39_660.0;

/// Tolerance used when checking that encoder counts per pulse are integral.
pub const INTEGER_TOLERANCE: f64 = 1e-5;

// =============================================================================
// Velocity Limits
// =============================================================================

/// Maximum rotation speed for reset moves (deg/s).
pub const TOMO_ROTARY_STAGE_VELO_RESET_MAX: f64 = 30.0;

/// Maximum rotation speed while scanning (deg/s).
pub const TOMO_ROTARY_STAGE_VELO_SCAN_MAX: f64 = 60.0;

// =============================================================================
// Completion Loop Timing
// =============================================================================

/// Timeout of a single completion-group wait. Expiry is not a failure.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Sleep between completion polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on completion polls before a hardware timeout is raised.
pub const DEFAULT_MAX_POLLS: u32 = 1_200;

/// Rotary stage encoder geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderGeometry {
    /// Counts per full revolution.
    pub counts_per_revolution: f64,
    /// Degrees per full revolution.
    pub degrees_per_revolution: f64,
    /// Encoder reading at 0 degrees.
    pub zero_offset: f64,
}

impl Default for EncoderGeometry {
    fn default() -> Self {
        Self {
            counts_per_revolution: COUNTS_PER_REVOLUTION,
            degrees_per_revolution: DEG_PER_REVOLUTION,
            zero_offset: ZERO_OFFSET,
        }
    }
}

impl EncoderGeometry {
    /// Encoder counts per degree.
    pub fn counts_per_degree(&self) -> f64 {
        self.counts_per_revolution / self.degrees_per_revolution
    }

    /// Encoder reading at `degrees`.
    ///
    /// The stage encoder counts down as the angle increases.
    pub fn encoder_counts(&self, degrees: f64) -> f64 {
        -(degrees * self.counts_per_degree() + self.zero_offset)
    }

    /// Encoder counts between consecutive pulses for `num_images` pulses
    /// spread over `angular_range` degrees.
    ///
    /// The result is signed and not rounded; callers decide whether it is
    /// acceptable.
    pub fn counts_per_pulse(&self, angular_range: f64, num_images: u32) -> f64 {
        let intervals = f64::from(num_images.saturating_sub(1));
        self.counts_per_revolution / ((self.degrees_per_revolution / angular_range) * intervals)
    }
}

/// Velocity ceilings for the rotation axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityLimits {
    /// Ceiling for reset moves (deg/s).
    pub reset_max: f64,
    /// Ceiling while scanning (deg/s).
    pub scan_max: f64,
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self {
            reset_max: TOMO_ROTARY_STAGE_VELO_RESET_MAX,
            scan_max: TOMO_ROTARY_STAGE_VELO_SCAN_MAX,
        }
    }
}

/// Whether `value` is an integer within `tolerance`.
pub fn is_integral(value: f64, tolerance: f64) -> bool {
    value.is_finite() && (value - value.round()).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_degree() {
        assert_eq!(COUNTS_PER_DEG, 200.0);
        assert_eq!(EncoderGeometry::default().counts_per_degree(), 200.0);
    }

    #[test]
    fn test_encoder_counts_at_zero_is_negative_offset() {
        let geometry = EncoderGeometry::default();
        assert_eq!(geometry.encoder_counts(0.0), -39_660.0);
        assert_eq!(geometry.encoder_counts(90.0), -(18_000.0 + 39_660.0));
    }

    #[test]
    fn test_counts_per_pulse_half_turn() {
        let geometry = EncoderGeometry::default();
        let counts = geometry.counts_per_pulse(180.0, 1801);
        assert!(is_integral(counts, INTEGER_TOLERANCE));
        assert!((counts - 20.0).abs() < INTEGER_TOLERANCE);
    }

    #[test]
    fn test_counts_per_pulse_non_integral() {
        let geometry = EncoderGeometry::default();
        assert!(!is_integral(geometry.counts_per_pulse(170.0, 1801), INTEGER_TOLERANCE));
    }

    #[test]
    fn test_is_integral_rejects_non_finite() {
        assert!(!is_integral(f64::INFINITY, INTEGER_TOLERANCE));
        assert!(!is_integral(f64::NAN, INTEGER_TOLERANCE));
        assert!(is_integral(3.000_000_1, INTEGER_TOLERANCE));
    }
}
