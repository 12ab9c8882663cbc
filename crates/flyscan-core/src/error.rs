//! Error taxonomy for flyscan planning and coordination.
//!
//! `FlyscanError` is the single error type returned by the planner, the
//! lifecycle coordinator and the completion loop. Capability traits return
//! `anyhow::Result` so device implementations can attach their own context;
//! the coordinator wraps those failures into [`FlyscanError::Participant`]
//! together with the participant name and lifecycle phase.
//!
//! ## Error Categories
//!
//! - **`Configuration`**: infeasible timing or geometry input. Raised before
//!   any hardware is touched. The caller adjusts parameters and retries.
//! - **`Precondition`**: a required condition is not met (front-end shutter
//!   closed, required camera absent). Raised before staging.
//! - **`InvalidState`**: lifecycle misuse such as staging twice or completing
//!   a participant that was never prepared. Indicates a coordination bug.
//! - **`HardwareTimeout`**: the completion loop exceeded its bounded number of
//!   poll cycles. Individual poll timeouts are normal and never surface.
//! - **`Participant`**: a device call failed.
//! - **`Aborted`**: an operator abort was observed at a suspension point.
//! - **`Unstage`** / **`WithUnstageErrors`**: cleanup failures (`unstage`
//!   calls and finalizer actions, told apart by [`Phase`]), reported on their
//!   own or attached behind a primary error, never in place of it.

use std::fmt;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Classification of a failure raised inside a device implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device rejected a configuration value.
    Configuration,
    /// Link to the device was lost.
    Communication,
    /// Device reported a fault.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Operation is not valid in the device's current state.
    InvalidState,
    /// Anything else.
    Unknown,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidState => "invalid_state",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a device implementation.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver identifier, e.g. `mock_rotary_axis`.
    pub driver_type: String,
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Lifecycle Phases
// =============================================================================

/// Lifecycle phase in which a participant call was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Motion or trigger-unit setup before staging.
    Setup,
    /// `stage`.
    Stage,
    /// `prepare`.
    Prepare,
    /// `kickoff`.
    Kickoff,
    /// `complete`.
    Complete,
    /// `collect`.
    Collect,
    /// `unstage`.
    Unstage,
    /// Finalizer actions.
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Setup => "setup",
            Phase::Stage => "stage",
            Phase::Prepare => "prepare",
            Phase::Kickoff => "kickoff",
            Phase::Complete => "complete",
            Phase::Collect => "collect",
            Phase::Unstage => "unstage",
            Phase::Finalize => "finalize",
        };
        write!(f, "{}", label)
    }
}

/// A single failed cleanup call: an `unstage` or a finalizer action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstageFailure {
    /// Participant or finalizer action that failed.
    pub participant: String,
    /// [`Phase::Unstage`] or [`Phase::Finalize`].
    pub phase: Phase,
    /// Rendered error message.
    pub message: String,
}

impl UnstageFailure {
    /// Failed `unstage` of `participant`.
    pub fn unstage(participant: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            participant: participant.into(),
            phase: Phase::Unstage,
            message: format!("{:#}", error),
        }
    }

    /// Failed finalizer action `action`.
    pub fn finalize(action: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            participant: action.into(),
            phase: Phase::Finalize,
            message: format!("{:#}", error),
        }
    }
}

impl fmt::Display for UnstageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.participant, self.phase, self.message)
    }
}

fn join_failures(failures: &[UnstageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// FlyscanError
// =============================================================================

/// Convenience alias for results using [`FlyscanError`].
pub type FlyscanResult<T> = std::result::Result<T, FlyscanError>;

/// Primary error type for planning and coordinating a flyscan.
///
/// # Example
///
/// ```rust,ignore
/// use flyscan_core::error::{FlyscanError, FlyscanResult};
///
/// fn check_images(num_images: u32) -> FlyscanResult<()> {
///     if num_images < 2 {
///         return Err(FlyscanError::Configuration(
///             "at least two images are required".into(),
///         ));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum FlyscanError {
    /// Infeasible timing or geometry input.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required precondition was not met.
    #[error("Precondition not met: {0}")]
    Precondition(String),

    /// Lifecycle misuse (double stage, complete before prepare, ...).
    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    /// The completion loop gave up after its bounded number of polls.
    #[error("Hardware timeout: group '{group}' still pending after {polls} poll cycles ({pending:?})")]
    HardwareTimeout {
        /// Completion group name.
        group: String,
        /// Number of poll cycles performed.
        polls: u32,
        /// Members that had not completed.
        pending: Vec<String>,
    },

    /// A participant call failed.
    #[error("Participant '{participant}' failed during {phase}: {source:#}")]
    Participant {
        /// Participant name.
        participant: String,
        /// Phase the call belonged to.
        phase: Phase,
        /// Underlying device error.
        #[source]
        source: anyhow::Error,
    },

    /// Operator abort observed at a suspension point.
    #[error("Scan aborted: {0}")]
    Aborted(String),

    /// Unstage or finalizer failures with no earlier error in flight.
    #[error("Cleanup failed for {} participant(s): {}", .0.len(), join_failures(.0))]
    Unstage(Vec<UnstageFailure>),

    /// A primary error followed by unstage or finalizer failures during cleanup.
    #[error("{primary} (followed by {} cleanup failure(s): {})", unstage_errors.len(), join_failures(unstage_errors))]
    WithUnstageErrors {
        /// The error that ended the scan.
        primary: Box<FlyscanError>,
        /// Failures collected while unstaging afterwards.
        unstage_errors: Vec<UnstageFailure>,
    },
}

impl FlyscanError {
    /// Wrap a device error raised during `phase`.
    pub fn participant(participant: impl Into<String>, phase: Phase, source: anyhow::Error) -> Self {
        Self::Participant {
            participant: participant.into(),
            phase,
            source,
        }
    }

    /// Attach unstage failures behind this error.
    ///
    /// Returns `self` unchanged when `unstage_errors` is empty.
    pub fn with_unstage_errors(self, unstage_errors: Vec<UnstageFailure>) -> Self {
        if unstage_errors.is_empty() {
            return self;
        }
        match self {
            FlyscanError::WithUnstageErrors {
                primary,
                unstage_errors: mut existing,
            } => {
                existing.extend(unstage_errors);
                FlyscanError::WithUnstageErrors {
                    primary,
                    unstage_errors: existing,
                }
            }
            other => FlyscanError::WithUnstageErrors {
                primary: Box::new(other),
                unstage_errors,
            },
        }
    }

    /// The error that ended the scan, looking through unstage aggregation.
    pub fn primary(&self) -> &FlyscanError {
        match self {
            FlyscanError::WithUnstageErrors { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Whether the caller can retry after adjusting inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.primary(),
            FlyscanError::Configuration(_) | FlyscanError::Precondition(_)
        )
    }

    /// Whether this error came from an operator abort.
    pub fn is_abort(&self) -> bool {
        matches!(self.primary(), FlyscanError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("mock_shutter", DriverErrorKind::Timeout, "no answer");
        assert_eq!(
            err.to_string(),
            "Driver 'mock_shutter' timeout error: no answer"
        );
    }

    #[test]
    fn test_primary_survives_unstage_aggregation() {
        let primary = FlyscanError::Aborted("operator interrupt".into());
        let err = primary.with_unstage_errors(vec![
            UnstageFailure::unstage("panda_flyer", &anyhow::anyhow!("communication lost")),
            UnstageFailure::finalize("close_shutter", &anyhow::anyhow!("jammed")),
        ]);

        assert!(err.is_abort());
        let rendered = err.to_string();
        assert!(rendered.starts_with("Scan aborted: operator interrupt"));
        assert!(rendered.contains("2 cleanup failure(s)"));
        assert!(rendered.contains("panda_flyer (unstage): communication lost"));
        assert!(rendered.contains("close_shutter (finalize): jammed"));
    }

    #[test]
    fn test_empty_unstage_errors_leave_error_untouched() {
        let err = FlyscanError::Configuration("bad".into()).with_unstage_errors(Vec::new());
        assert!(matches!(err, FlyscanError::Configuration(_)));
    }

    #[test]
    fn test_unstage_errors_accumulate() {
        let failure = |name: &str| UnstageFailure::unstage(name, &anyhow::anyhow!("fault"));
        let err = FlyscanError::InvalidState("x".into())
            .with_unstage_errors(vec![failure("a")])
            .with_unstage_errors(vec![failure("b")]);

        match err {
            FlyscanError::WithUnstageErrors {
                primary,
                unstage_errors,
            } => {
                assert!(matches!(*primary, FlyscanError::InvalidState(_)));
                assert_eq!(unstage_errors.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(FlyscanError::Configuration("x".into()).is_recoverable());
        assert!(FlyscanError::Precondition("x".into()).is_recoverable());
        assert!(!FlyscanError::InvalidState("x".into()).is_recoverable());
        assert!(!FlyscanError::participant(
            "kinetix_detector",
            Phase::Kickoff,
            anyhow::anyhow!("boom")
        )
        .is_recoverable());
    }

    #[test]
    fn test_participant_error_display_includes_phase() {
        let err = FlyscanError::participant(
            "panda_detector",
            Phase::Stage,
            anyhow::Error::new(DriverError::new(
                "mock_detector",
                DriverErrorKind::Hardware,
                "fault 7",
            )),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("panda_detector"));
        assert!(rendered.contains("during stage"));
        assert!(rendered.contains("fault 7"));
    }
}
