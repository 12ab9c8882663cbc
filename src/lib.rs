//! # hex-flyscan
//!
//! Application layer around the flyscan crates:
//!
//! - **`config`**: layered Figment configuration (defaults, TOML file,
//!   `HEX_FLYSCAN_` environment variables) with validation
//! - **`logging`**: `tracing-subscriber` setup in pretty, compact or JSON form
//! - **`simulation`**: a mock tomography endstation built from the device
//!   section of the configuration
//!
//! The planner, the lifecycle coordinator and the plans themselves live in
//! `flyscan-experiment`; the capability traits and shared types live in
//! `flyscan-core`.

pub mod config;
pub mod logging;
pub mod simulation;

pub use config::FlyscanConfig;
pub use simulation::{plan_context, SimulatedEndstation};
