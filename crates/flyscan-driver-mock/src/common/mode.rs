//! Operational modes for mock devices.
//!
//! - **Instant**: Motion and frames complete without delay, for unit tests
//! - **Realistic**: Hardware-like timing driven by `tokio::time`, for
//!   integration tests (pair with paused time to keep them fast)
//! - **Chaos**: Realistic timing plus configured failure injection

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic
    #[default]
    Instant,
    /// Hardware-like timing
    Realistic,
    /// Hardware-like timing with failures
    Chaos,
}

impl MockMode {
    /// Whether this mode simulates elapsed time.
    pub fn is_timed(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

impl FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!(
                "Unknown mock mode '{}'. Must be one of: instant, realistic, chaos",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
    }

    #[test]
    fn test_timed_modes() {
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Realistic.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("Realistic".parse::<MockMode>(), Ok(MockMode::Realistic));
        assert!("slow".parse::<MockMode>().is_err());
    }
}
