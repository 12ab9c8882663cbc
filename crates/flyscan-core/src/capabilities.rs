//! Capability traits for flyscan participants.
//!
//! Hardware is described by the capabilities it supports rather than by a
//! class hierarchy. A rotation axis implements [`Movable`] and
//! [`VelocityControl`]; trigger logic and detectors implement the full
//! acquisition lifecycle ([`Stageable`], [`Preparable`], [`Kickoffable`],
//! [`Completable`]); detectors additionally implement [`Collectable`].
//!
//! Every method is async and takes `&self`. Implementations use interior
//! mutability for state, and every call is a potential suspension point.

use crate::data::StreamDatum;
use crate::readout::ReadoutMode;
use crate::trigger::{PcompSetup, TriggerInfo};
use anyhow::Result;
use async_trait::async_trait;

// =============================================================================
// Motion
// =============================================================================

/// Capability: Motion Control
///
/// # Contract
/// - Positions are in device-native units (degrees for the rotation axis)
/// - `move_abs` and `move_rel` initiate motion and may return before completion
/// - `wait_settled` blocks until motion completes
/// - `position` may be approximate during motion
#[async_trait]
pub trait Movable: Send + Sync {
    /// Start a move to an absolute position.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Start a move relative to the current position.
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Current position.
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle.
    ///
    /// Implementations carry an internal timeout.
    async fn wait_settled(&self) -> Result<()>;

    /// Halt motion in progress.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Velocity Control
#[async_trait]
pub trait VelocityControl: Send + Sync {
    /// Set the speed used by subsequent moves (device units per second).
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Current speed setting.
    async fn velocity(&self) -> Result<f64>;
}

/// A rotation axis: position and velocity control.
pub trait MotionAxis: Movable + VelocityControl {}

impl<T: Movable + VelocityControl + ?Sized> MotionAxis for T {}

// =============================================================================
// Acquisition Lifecycle
// =============================================================================

/// Capability: Staging (Bluesky-style lifecycle)
///
/// # Contract
/// - `stage()` claims the device for one acquisition sequence
/// - `unstage()` releases it and disarms anything still running
/// - Both are called at most once per scan by the coordinator
#[async_trait]
pub trait Stageable: Send + Sync {
    /// Claim the device for an acquisition sequence.
    async fn stage(&self) -> Result<()>;

    /// Release the device.
    async fn unstage(&self) -> Result<()>;

    /// Query staging state.
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_staged(&self) -> Result<bool> {
        anyhow::bail!("Staging state query not supported by this device")
    }
}

/// Capability: Preparation with a device-specific setup value.
///
/// Trigger logic is prepared with its own setup type (a pulse count,
/// a [`crate::trigger::CameraTriggerSetup`]); detectors are prepared with the
/// [`TriggerInfo`] their trigger logic reports.
#[async_trait]
pub trait Preparable<T: Send + 'static>: Send + Sync {
    /// Arm the device for `value`. Only valid while staged.
    async fn prepare(&self, value: T) -> Result<()>;
}

/// Capability: Kickoff
///
/// # Contract
/// - Starts acquisition and returns once the device is running
/// - Never waits for acquisition to finish
#[async_trait]
pub trait Kickoffable: Send + Sync {
    /// Start acquiring.
    async fn kickoff(&self) -> Result<()>;
}

/// Capability: Completion
#[async_trait]
pub trait Completable: Send + Sync {
    /// Resolve once the acquisition started by `kickoff` has finished.
    ///
    /// May take arbitrarily long. Callers bound it with their own timeouts.
    async fn complete(&self) -> Result<()>;
}

/// Capability: Stream collection
///
/// # Contract
/// - `collect` reports frames written since the previous call and may return
///   nothing (at-least-once draining)
/// - `captured_count` reads the writer's running total
#[async_trait]
pub trait Collectable: Send + Sync {
    /// Newly written frame ranges since the last call.
    async fn collect(&self) -> Result<Vec<StreamDatum>>;

    /// Total frames written in the current acquisition.
    async fn captured_count(&self) -> Result<u64>;
}

/// Trigger logic that describes its trigger train once prepared.
pub trait TriggerInfoSource: Send + Sync {
    /// Trigger train for downstream detectors, `None` until prepared.
    fn trigger_info(&self) -> Option<TriggerInfo>;
}

/// Full lifecycle of trigger logic or a detector prepared with `T`.
pub trait Acquirer<T: Send + 'static>: Stageable + Preparable<T> + Kickoffable + Completable {}

impl<T, D> Acquirer<T> for D
where
    T: Send + 'static,
    D: Stageable + Preparable<T> + Kickoffable + Completable + ?Sized,
{
}

// =============================================================================
// Trigger Unit, Camera, Shutters
// =============================================================================

/// Capability: Position compare on the trigger unit.
#[async_trait]
pub trait PositionCompare: Send + Sync {
    /// Load start position, step and pulse count.
    async fn configure_pcomp(&self, setup: PcompSetup) -> Result<()>;
}

/// Capability: Readout mode query on an area detector.
#[async_trait]
pub trait ReadoutModeSource: Send + Sync {
    /// Currently configured readout mode.
    async fn readout_mode(&self) -> Result<ReadoutMode>;
}

/// Capability: Shutter status readback.
#[async_trait]
pub trait ShutterStatus: Send + Sync {
    /// Whether the shutter reports open.
    async fn is_open(&self) -> Result<bool>;
}

/// Capability: Shutter actuation.
#[async_trait]
pub trait ShutterControl: ShutterStatus {
    /// Open the shutter and wait for confirmation.
    async fn open(&self) -> Result<()>;

    /// Close the shutter and wait for confirmation.
    async fn close(&self) -> Result<()>;
}
