//! Camera readout modes and their frame-rate ceilings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Readout mode of the area detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    /// Low-noise mode.
    Sensitivity,
    /// Highest frame rate.
    Speed,
    /// Extended dynamic range.
    DynamicRange,
}

impl Default for ReadoutMode {
    fn default() -> Self {
        ReadoutMode::Sensitivity
    }
}

impl fmt::Display for ReadoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadoutMode::Sensitivity => write!(f, "sensitivity"),
            ReadoutMode::Speed => write!(f, "speed"),
            ReadoutMode::DynamicRange => write!(f, "dynamic_range"),
        }
    }
}

impl FromStr for ReadoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sensitivity" => Ok(ReadoutMode::Sensitivity),
            "speed" => Ok(ReadoutMode::Speed),
            "dynamic_range" | "dynamic-range" => Ok(ReadoutMode::DynamicRange),
            other => Err(format!(
                "Unknown readout mode '{}'. Must be one of: sensitivity, speed, dynamic_range",
                other
            )),
        }
    }
}

/// Maximum frame rate (fps) per readout mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FramerateTable {
    /// Ceiling in [`ReadoutMode::Sensitivity`].
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Ceiling in [`ReadoutMode::Speed`].
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Ceiling in [`ReadoutMode::DynamicRange`].
    #[serde(default = "default_dynamic_range")]
    pub dynamic_range: f64,
}

fn default_sensitivity() -> f64 {
    80.0
}

fn default_speed() -> f64 {
    250.0
}

fn default_dynamic_range() -> f64 {
    75.0
}

impl Default for FramerateTable {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            speed: default_speed(),
            dynamic_range: default_dynamic_range(),
        }
    }
}

impl FramerateTable {
    /// Frame-rate ceiling for `mode`.
    pub fn max_for(&self, mode: ReadoutMode) -> f64 {
        match mode {
            ReadoutMode::Sensitivity => self.sensitivity,
            ReadoutMode::Speed => self.speed,
            ReadoutMode::DynamicRange => self.dynamic_range,
        }
    }

    /// Validate that every ceiling is a positive finite number.
    pub fn validate(&self) -> Result<(), String> {
        for (mode, fps) in [
            (ReadoutMode::Sensitivity, self.sensitivity),
            (ReadoutMode::Speed, self.speed),
            (ReadoutMode::DynamicRange, self.dynamic_range),
        ] {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(format!("Max framerate for {} must be positive, got {}", mode, fps));
            }
        }
        Ok(())
    }
}
