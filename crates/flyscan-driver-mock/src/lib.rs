//! Mock Hardware for hex-flyscan
//!
//! Simulated tomography endstation devices for testing the planner and the
//! lifecycle coordinator without a beamline. All devices use async-safe
//! operations (`tokio::time::sleep`, never `std::thread::sleep`) and run
//! their acquisitions on background tokio tasks, the way real device layers
//! do.
//!
//! # Available Mock Devices
//!
//! - [`MockRotaryAxis`] - rotation stage with velocity control and a
//!   published position feed
//! - [`MockPanda`] - trigger unit: encoder position-compare flyer plus
//!   position capture detector
//! - [`MockKinetix`] - camera: hardware or software trigger logic plus
//!   detector writer, with a readout mode
//! - [`MockShutter`] - shutter with open/close command counters
//!
//! Devices are wired together through [`TriggerLine`]s:
//!
//! ```rust,ignore
//! use flyscan_driver_mock::{MockKinetix, MockPanda, MockRotaryAxis, TriggerLine};
//!
//! let axis = MockRotaryAxis::builder().mode(MockMode::Realistic).build();
//! let line = TriggerLine::new("panda_out");
//! let panda = MockPanda::builder(axis.subscribe_position(), line.clone()).build();
//! let kinetix = MockKinetix::builder(line).build();
//! ```
//!
//! # Timing
//!
//! - MockRotaryAxis: position update every 5 ms, 30 ms settling
//! - MockKinetix: exposure (livetime) plus 2 ms readout per frame
//! - MockShutter: 200 ms actuation

pub mod common;
mod mock_detector;
mod mock_kinetix;
mod mock_panda;
mod mock_rotary_axis;
mod mock_shutter;
mod trigger_line;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

// Re-export device types
pub use mock_detector::{MockDetector, MockDetectorBuilder};
pub use mock_kinetix::{MockCameraFlyer, MockKinetix, MockKinetixBuilder};
pub use mock_panda::{MockPanda, MockPandaBuilder, MockPcompFlyer, PandaTriggerTiming};
pub use mock_rotary_axis::{AxisLimits, MockRotaryAxis, MockRotaryAxisBuilder};
pub use mock_shutter::MockShutter;
pub use trigger_line::{PulseBurst, TriggerLine};
