//! Core types and traits for hex-flyscan.
//!
//! - [`capabilities`]: async capability traits implemented by hardware
//! - [`error`]: the [`FlyscanError`](error::FlyscanError) taxonomy
//! - [`limits`]: encoder geometry, velocity ceilings, loop timing defaults
//! - [`timing`]: scan timing inputs and derived trigger schedules
//! - [`trigger`]: trigger descriptions passed between devices
//! - [`readout`]: camera readout modes and frame-rate ceilings
//! - [`data`]: stream records reported by collectors
//! - [`session`]: per-session scan bookkeeping

pub mod capabilities;
pub mod data;
pub mod error;
pub mod limits;
pub mod readout;
pub mod session;
pub mod timing;
pub mod trigger;

pub use error::{FlyscanError, FlyscanResult};
