//! Timing configuration for realistic mode.

use std::time::Duration;

/// Hardware-like delays used when a mock runs in a timed [`super::MockMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Readout time added after each frame exposure (ms)
    pub frame_readout_ms: u64,
    /// Time to settle after motion ends (ms)
    pub settling_time_ms: u64,
    /// Per-command communication delay (ms)
    pub communication_delay_ms: u64,
    /// Interval between simulated position updates during motion (ms)
    pub motion_tick_ms: u64,
}

impl TimingConfig {
    /// Timing for the tomography rotation stage.
    pub fn rotary_axis() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 30,
            communication_delay_ms: 3,
            motion_tick_ms: 5,
        }
    }

    /// Timing for the area detector.
    pub fn camera() -> Self {
        Self {
            frame_readout_ms: 2,
            settling_time_ms: 0,
            communication_delay_ms: 2,
            motion_tick_ms: 0,
        }
    }

    /// Timing for the trigger unit and its position capture.
    pub fn trigger_unit() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 0,
            communication_delay_ms: 1,
            motion_tick_ms: 0,
        }
    }

    /// Timing for a two-button shutter.
    pub fn shutter() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 200,
            communication_delay_ms: 5,
            motion_tick_ms: 0,
        }
    }

    /// Per-command delay.
    pub fn communication_delay(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }

    /// Post-motion settling delay.
    pub fn settling_time(&self) -> Duration {
        Duration::from_millis(self.settling_time_ms)
    }

    /// Frame readout delay.
    pub fn frame_readout(&self) -> Duration {
        Duration::from_millis(self.frame_readout_ms)
    }

    /// Motion update interval, never zero.
    pub fn motion_tick(&self) -> Duration {
        Duration::from_millis(self.motion_tick_ms.max(1))
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 0,
            communication_delay_ms: 0,
            motion_tick_ms: 1,
        }
    }
}
