//! Trigger descriptions exchanged between trigger logic and detectors.
//!
//! A scan arms two kinds of acquirer:
//! - **trigger logic** (flyers), prepared with a device-specific setup value,
//!   which then describe the resulting trigger train as a [`TriggerInfo`];
//! - **detectors**, prepared with that [`TriggerInfo`].
//!
//! The deadtime in a [`TriggerInfo`] always comes from the device that
//! produced it. There is no shared default.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a detector is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorTrigger {
    /// Detector generates its own triggers.
    Internal,
    /// One frame per rising edge on the trigger input.
    EdgeTrigger,
    /// Acquisition while the gate is high, fixed gate width.
    ConstantGate,
    /// Acquisition while the gate is high, variable gate width.
    VariableGate,
}

impl DetectorTrigger {
    /// Whether the triggers come from outside the detector.
    pub fn is_external(self) -> bool {
        !matches!(self, DetectorTrigger::Internal)
    }
}

impl fmt::Display for DetectorTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorTrigger::Internal => write!(f, "internal"),
            DetectorTrigger::EdgeTrigger => write!(f, "edge_trigger"),
            DetectorTrigger::ConstantGate => write!(f, "constant_gate"),
            DetectorTrigger::VariableGate => write!(f, "variable_gate"),
        }
    }
}

/// Trigger train handed to a detector on prepare.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Number of frames to expect.
    pub num: u32,
    /// Trigger type.
    pub trigger: DetectorTrigger,
    /// Minimum gap between frames (s).
    pub deadtime: f64,
    /// Exposure per frame (s).
    pub livetime: f64,
}

/// Setup value for camera trigger logic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraTriggerSetup {
    /// Frames to acquire.
    pub num_images: u32,
    /// Exposure per frame (s). `None` lets the camera pick.
    pub exposure_time: Option<f64>,
    /// Generate triggers in software instead of waiting for the trigger input.
    pub software_trigger: bool,
}

/// Direction in which the position-compare block counts pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcompDirection {
    /// Encoder value increases during the scan.
    Positive,
    /// Encoder value decreases during the scan.
    Negative,
}

/// Position-compare configuration of the trigger unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcompSetup {
    /// Encoder position of the first pulse.
    pub start: i64,
    /// Encoder counts between pulses.
    pub step: u64,
    /// Number of pulses.
    pub pulses: u32,
    /// Counting direction.
    pub direction: PcompDirection,
}

/// Arming state of a trigger logic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerState {
    /// Never staged.
    #[default]
    Null,
    /// Prepared, waiting for kickoff.
    Preparing,
    /// Running.
    Starting,
    /// Disarmed.
    Stopping,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerState::Null => write!(f, "null"),
            TriggerState::Preparing => write!(f, "preparing"),
            TriggerState::Starting => write!(f, "starting"),
            TriggerState::Stopping => write!(f, "stopping"),
        }
    }
}
