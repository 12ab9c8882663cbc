//! Mock tomography rotation stage.
//!
//! Moves are non-blocking: `move_abs` starts a background task that advances
//! the position at the configured velocity and publishes every update on a
//! `watch` channel. The trigger unit listens to that channel to fire
//! position-compare pulses, which is what makes the motion the trigger source
//! of a flyscan.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use flyscan_core::capabilities::{Movable, VelocityControl};
use flyscan_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const DRIVER_TYPE: &str = "mock_rotary_axis";

/// Travel limits in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    /// Lowest reachable angle.
    pub min: f64,
    /// Highest reachable angle.
    pub max: f64,
}

impl AxisLimits {
    fn enforce(&self, target: f64) -> Result<f64> {
        if target < self.min || target > self.max {
            return Err(anyhow!(
                "Target {:.3} deg outside travel limits [{:.3}, {:.3}]",
                target,
                self.min,
                self.max
            ));
        }
        Ok(target)
    }
}

/// Simulated rotation axis with velocity control.
///
/// # Example
///
/// ```rust,ignore
/// let axis = MockRotaryAxis::builder().mode(MockMode::Realistic).build();
/// axis.set_velocity(30.0).await?;
/// axis.move_abs(-10.0).await?;
/// axis.wait_settled().await?;
/// ```
pub struct MockRotaryAxis {
    position_tx: Arc<watch::Sender<f64>>,
    moving_tx: Arc<watch::Sender<bool>>,
    velocity: Mutex<f64>,
    velocity_history: Mutex<Vec<f64>>,
    motion_task: Mutex<Option<JoinHandle<()>>>,
    settle_timeout: Mutex<Duration>,
    max_velocity: f64,
    limits: Option<AxisLimits>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockRotaryAxis {
    /// Axis at 0 deg with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for custom configuration.
    pub fn builder() -> MockRotaryAxisBuilder {
        MockRotaryAxisBuilder::new()
    }

    /// Follow position updates.
    pub fn subscribe_position(&self) -> watch::Receiver<f64> {
        self.position_tx.subscribe()
    }

    /// Position without going through the async capability.
    pub fn current_position(&self) -> f64 {
        *self.position_tx.borrow()
    }

    /// Whether a move is in progress.
    pub fn is_moving(&self) -> bool {
        *self.moving_tx.borrow()
    }

    /// Every accepted `set_velocity` value in order.
    pub fn velocity_history(&self) -> Vec<f64> {
        self.velocity_history.lock().clone()
    }

    fn halt_motion(&self) {
        if let Some(task) = self.motion_task.lock().take() {
            task.abort();
        }
        self.moving_tx.send_replace(false);
    }

    async fn command_delay(&self) {
        if self.mode.is_timed() {
            sleep(self.timing.communication_delay()).await;
        }
    }
}

impl Default for MockRotaryAxis {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockRotaryAxis {
    fn drop(&mut self) {
        if let Some(task) = self.motion_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Movable for MockRotaryAxis {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, "move")?;

        let target = match &self.limits {
            Some(limits) => limits.enforce(target)?,
            None => target,
        };
        let velocity = *self.velocity.lock();
        if !(velocity.is_finite() && velocity > 0.0) {
            bail!("Cannot move with velocity {}", velocity);
        }

        self.halt_motion();
        self.command_delay().await;

        let start = self.current_position();
        let distance = (target - start).abs();
        tracing::debug!(
            from = start,
            to = target,
            velocity,
            "MockRotaryAxis: starting move"
        );

        if !self.mode.is_timed() || distance == 0.0 {
            self.position_tx.send_replace(target);
            return Ok(());
        }

        let travel = Duration::from_secs_f64(distance / velocity);
        *self.settle_timeout.lock() = travel * 2 + self.timing.settling_time() + Duration::from_secs(5);

        self.moving_tx.send_replace(true);
        let position_tx = self.position_tx.clone();
        let moving_tx = self.moving_tx.clone();
        let tick = self.timing.motion_tick();
        let settling = self.timing.settling_time();
        let direction = (target - start).signum();
        let increment = direction * velocity * tick.as_secs_f64();

        let task = tokio::spawn(async move {
            let mut position = start;
            loop {
                sleep(tick).await;
                position += increment;
                if (direction > 0.0 && position >= target) || (direction < 0.0 && position <= target) {
                    position_tx.send_replace(target);
                    break;
                }
                position_tx.send_replace(position);
            }
            sleep(settling).await;
            moving_tx.send_replace(false);
        });
        *self.motion_task.lock() = Some(task);
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let target = self.current_position() + distance;
        self.move_abs(target).await
    }

    async fn position(&self) -> Result<f64> {
        self.error_config.check_operation(DRIVER_TYPE, "position")?;
        Ok(self.current_position())
    }

    async fn wait_settled(&self) -> Result<()> {
        let mut moving = self.moving_tx.subscribe();
        let limit = *self.settle_timeout.lock();
        let result = match timeout(limit, moving.wait_for(|m| !*m)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => bail!("Motion status channel closed"),
            Err(_) => Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Timeout,
                format!("Motion did not settle within {:?}", limit),
            )
            .into()),
        };
        result
    }

    async fn stop(&self) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, "stop")?;
        self.halt_motion();
        tracing::debug!(position = self.current_position(), "MockRotaryAxis: stopped");
        Ok(())
    }
}

#[async_trait]
impl VelocityControl for MockRotaryAxis {
    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, "set_velocity")?;
        if !(velocity.is_finite() && velocity > 0.0 && velocity <= self.max_velocity) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Configuration,
                format!(
                    "Velocity {} outside (0, {}] deg/s",
                    velocity, self.max_velocity
                ),
            )
            .into());
        }
        self.command_delay().await;
        *self.velocity.lock() = velocity;
        self.velocity_history.lock().push(velocity);
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.velocity.lock())
    }
}

/// Builder for [`MockRotaryAxis`].
pub struct MockRotaryAxisBuilder {
    initial_position: f64,
    velocity: f64,
    max_velocity: f64,
    limits: Option<AxisLimits>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockRotaryAxisBuilder {
    /// Builder with defaults: 0 deg, 30 deg/s, instant mode.
    pub fn new() -> Self {
        Self {
            initial_position: 0.0,
            velocity: 30.0,
            max_velocity: 90.0,
            limits: None,
            mode: MockMode::Instant,
            timing: TimingConfig::rotary_axis(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Set initial position (deg).
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Set initial velocity (deg/s).
    pub fn velocity(mut self, velocity: f64) -> Self {
        self.velocity = velocity;
        self
    }

    /// Set the hardware velocity ceiling (deg/s).
    pub fn max_velocity(mut self, max_velocity: f64) -> Self {
        self.max_velocity = max_velocity;
        self
    }

    /// Set travel limits.
    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some(AxisLimits { min, max });
        self
    }

    /// Set operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override timing.
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set error injection.
    pub fn error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Build the axis.
    pub fn build(self) -> MockRotaryAxis {
        let (position_tx, _) = watch::channel(self.initial_position);
        let (moving_tx, _) = watch::channel(false);
        MockRotaryAxis {
            position_tx: Arc::new(position_tx),
            moving_tx: Arc::new(moving_tx),
            velocity: Mutex::new(self.velocity),
            velocity_history: Mutex::new(Vec::new()),
            motion_task: Mutex::new(None),
            settle_timeout: Mutex::new(Duration::from_secs(5)),
            max_velocity: self.max_velocity,
            limits: self.limits,
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
        }
    }
}

impl Default for MockRotaryAxisBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instant_move_jumps_to_target() {
        let axis = MockRotaryAxis::new();
        axis.move_abs(-10.0).await.unwrap();
        axis.wait_settled().await.unwrap();
        assert_eq!(axis.position().await.unwrap(), -10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_move_takes_distance_over_velocity() {
        let axis = MockRotaryAxis::builder().mode(MockMode::Realistic).build();
        axis.set_velocity(10.0).await.unwrap();

        let start = tokio::time::Instant::now();
        axis.move_abs(20.0).await.unwrap();
        assert!(axis.is_moving());
        axis.wait_settled().await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2_200), "elapsed {:?}", elapsed);
        assert_eq!(axis.current_position(), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_updates_are_published() {
        let axis = MockRotaryAxis::builder().mode(MockMode::Realistic).build();
        let mut rx = axis.subscribe_position();
        axis.set_velocity(60.0).await.unwrap();
        axis.move_abs(1.0).await.unwrap();

        rx.changed().await.unwrap();
        let first = *rx.borrow();
        assert!(first > 0.0 && first < 1.0, "first update {}", first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_motion() {
        let axis = MockRotaryAxis::builder().mode(MockMode::Realistic).build();
        axis.set_velocity(1.0).await.unwrap();
        axis.move_abs(100.0).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        axis.stop().await.unwrap();
        assert!(!axis.is_moving());
        let halted = axis.current_position();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(axis.current_position(), halted);
    }

    #[tokio::test]
    async fn test_velocity_history_and_ceiling() {
        let axis = MockRotaryAxis::builder().max_velocity(60.0).build();
        axis.set_velocity(30.0).await.unwrap();
        axis.set_velocity(9.0).await.unwrap();
        assert!(axis.set_velocity(61.0).await.is_err());
        assert!(axis.set_velocity(0.0).await.is_err());

        assert_eq!(axis.velocity_history(), vec![30.0, 9.0]);
        assert_eq!(axis.velocity().await.unwrap(), 9.0);
    }

    #[tokio::test]
    async fn test_limits_enforced() {
        let axis = MockRotaryAxis::builder().limits(-20.0, 380.0).build();
        assert!(axis.move_abs(400.0).await.is_err());
        assert!(axis.move_abs(370.0).await.is_ok());
    }
}
