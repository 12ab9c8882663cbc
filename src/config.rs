//! Configuration using Figment
//!
//! Configuration is layered, later layers winning:
//! 1. built-in defaults (the beamline constants)
//! 2. `config/flyscan.toml`
//! 3. environment variables prefixed with `HEX_FLYSCAN_`, nested keys
//!    separated by `__`
//!
//! # Example
//! ```no_run
//! use hex_flyscan::config::FlyscanConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FlyscanConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```
//!
//! Override the scan velocity ceiling for one run:
//! `HEX_FLYSCAN_LIMITS__VELOCITY__SCAN_MAX=45 hex-flyscan fly`

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use flyscan_core::readout::{FramerateTable, ReadoutMode};
use flyscan_core::session::{ProposalType, SessionContext};
use flyscan_core::timing::ScanTimingSpec;
use flyscan_driver_mock::{MockMode, PandaTriggerTiming};
use flyscan_experiment::{DrainSettings, PlannerLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/flyscan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HEX_FLYSCAN_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlyscanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Planner limits: velocity ceilings, encoder geometry
    pub limits: PlannerLimits,
    /// Camera frame-rate ceilings per readout mode
    pub framerates: FramerateTable,
    /// Completion loop timing
    pub coordinator: DrainSettings,
    /// Simulated endstation
    pub devices: DevicesConfig,
    /// Session bookkeeping
    pub session: SessionConfig,
    /// Default flyscan parameters
    pub scan: ScanTimingSpec,
    /// Default dark/flat parameters
    pub calibration: CalibrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Simulated endstation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Timing mode of every simulated device
    pub mode: MockMode,
    /// Whether the camera is installed
    pub camera_present: bool,
    /// Camera readout mode at startup
    pub readout_mode: ReadoutMode,
    /// Camera deadtime between frames (s)
    pub camera_deadtime: f64,
    /// Camera livetime when the exposure is left free (s)
    pub camera_default_livetime: f64,
    /// Trigger unit gate timing
    pub panda: PandaTriggerTiming,
    /// Whether the front-end shutter reports open
    pub fe_shutter_open: bool,
}

/// Session bookkeeping at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Facility cycle, e.g. `2026-2`
    pub cycle: String,
    /// Data session, e.g. `pass-313941`
    pub data_session: String,
    /// Proposal category
    pub proposal_type: ProposalType,
    /// Id of the last completed scan
    pub scan_id: u64,
}

/// Default dark/flat acquisition parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Frames per acquisition
    pub num_images: u32,
    /// Exposure per frame (s)
    pub exposure_time: f64,
    /// Sample stage offset for flats
    pub sample_offset: f64,
}

impl Default for FlyscanConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "hex-flyscan".to_string(),
                log_level: "info".to_string(),
                log_format: LogFormat::default(),
            },
            limits: PlannerLimits::default(),
            framerates: FramerateTable::default(),
            coordinator: DrainSettings::default(),
            devices: DevicesConfig::default(),
            session: SessionConfig::default(),
            scan: ScanTimingSpec::default().with_exposure(Some(0.01)),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Realistic,
            camera_present: true,
            readout_mode: ReadoutMode::default(),
            camera_deadtime: 0.001,
            camera_default_livetime: 0.01,
            panda: PandaTriggerTiming::default(),
            fe_shutter_open: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cycle: "2026-2".to_string(),
            data_session: "pass-000000".to_string(),
            proposal_type: ProposalType::Commissioning,
            scan_id: 0,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            num_images: 10,
            exposure_time: 0.1,
            sample_offset: 5.0,
        }
    }
}

impl SessionConfig {
    /// Session context to start from.
    pub fn context(&self) -> SessionContext {
        SessionContext::new(
            self.scan_id,
            self.cycle.clone(),
            self.data_session.clone(),
            self.proposal_type,
        )
    }
}

impl FlyscanConfig {
    /// Load configuration from config/flyscan.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix HEX_FLYSCAN_
    /// Example: HEX_FLYSCAN_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered providers, for callers that add their own.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(FlyscanConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let velocity = &self.limits.velocity;
        if !(velocity.scan_max > 0.0 && velocity.reset_max > 0.0) {
            return Err(format!(
                "Velocity ceilings must be positive (scan_max {}, reset_max {})",
                velocity.scan_max, velocity.reset_max
            ));
        }
        let geometry = &self.limits.geometry;
        if !(geometry.counts_per_revolution > 0.0 && geometry.degrees_per_revolution > 0.0) {
            return Err("Encoder geometry must have positive counts and degrees per revolution".into());
        }
        if self.limits.readout_overhead < 0.0 || self.limits.integer_tolerance < 0.0 {
            return Err("readout_overhead and integer_tolerance must not be negative".into());
        }

        self.framerates.validate()?;

        if self.coordinator.poll_timeout.is_zero() || self.coordinator.max_polls == 0 {
            return Err(format!(
                "Completion loop needs a non-zero poll_timeout and max_polls (got {:?}, {})",
                self.coordinator.poll_timeout, self.coordinator.max_polls
            ));
        }

        // Deadtimes are per device and may be zero, never negative
        for (device, deadtime) in [
            ("camera", self.devices.camera_deadtime),
            ("panda", self.devices.panda.deadtime),
        ] {
            if !(deadtime.is_finite() && deadtime >= 0.0) {
                return Err(format!("Invalid {} deadtime {}", device, deadtime));
            }
        }

        if self.calibration.num_images == 0 || self.calibration.exposure_time <= 0.0 {
            return Err(format!(
                "Calibration needs at least one frame and a positive exposure (got {}, {})",
                self.calibration.num_images, self.calibration.exposure_time
            ));
        }

        Ok(())
    }
}
