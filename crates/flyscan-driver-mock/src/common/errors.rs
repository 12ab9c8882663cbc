//! Error injection framework for mock devices.
//!
//! Every mock device checks its `ErrorConfig` at the start of each operation
//! (`"stage"`, `"prepare"`, `"kickoff"`, `"move"`, ...). Failures surface as
//! [`DriverError`]s from flyscan-core.

use super::rng::MockRng;
use flyscan_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches any operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail after N successful operations
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Timeout on specific operation
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// Simulate communication loss (sticky)
    CommunicationLoss,
    /// Hardware fault with specific code (sticky)
    HardwareFault {
        /// Fault code
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures and optional seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Create error config with custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }

        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected '{}' failure after {} operations", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("test_driver", "stage").is_ok());
        }
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "kickoff",
            count: 2,
        });

        assert!(config.check_operation("test_driver", "kickoff").is_ok());
        assert!(config.check_operation("test_driver", "kickoff").is_ok());
        assert!(config.check_operation("test_driver", "kickoff").is_err());
        // Other operations are unaffected
        assert!(config.check_operation("test_driver", "stage").is_ok());
    }

    #[test]
    fn test_fail_immediately() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "stage",
            count: 0,
        });
        let err = config.check_operation("mock_detector", "stage").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert_eq!(err.driver_type, "mock_detector");
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout { operation: "move" });

        let err = config.check_operation("test_driver", "move").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_communication_loss_is_sticky() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);

        let err = config.check_operation("test_driver", "stage").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
        assert!(config.check_operation("test_driver", "unstage").is_err());
    }

    #[test]
    fn test_hardware_fault() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });

        let err = config.check_operation("test_driver", "collect").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("66"));
    }

    #[test]
    fn test_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "prepare",
            count: 1,
        });

        assert!(config.check_operation("test_driver", "prepare").is_ok());
        assert!(config.check_operation("test_driver", "prepare").is_err());

        config.reset();

        assert!(config.check_operation("test_driver", "prepare").is_ok());
        assert!(config.check_operation("test_driver", "prepare").is_err());
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert("collect", 1.0);
        rates.insert("stage", 0.0);

        let config = ErrorConfig::with_rates(rates);

        for _ in 0..10 {
            assert!(config.check_operation("test_driver", "collect").is_err());
            assert!(config.check_operation("test_driver", "stage").is_ok());
        }
    }

    #[test]
    fn test_seeded_random_failures_roughly_match_rate() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("test_driver", "collect").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }
}
