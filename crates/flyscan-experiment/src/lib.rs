//! Flyscan orchestration
//!
//! Plans a hardware-triggered tomography flyscan and drives the participating
//! devices through their lifecycle.
//!
//! # Architecture
//!
//! - **Planner**: turns a [`ScanTimingSpec`](flyscan_core::timing::ScanTimingSpec)
//!   into a [`TriggerSchedule`](flyscan_core::timing::TriggerSchedule) or
//!   rejects it as infeasible, before any hardware is touched
//! - **Coordinator**: stage, prepare, kickoff, complete, collect, unstage
//!   across a [`ParticipantSet`], with rollback and a run-once finalizer
//! - **Completion**: completion groups and the poll/drain loop that collects
//!   data while waiting
//! - **Plans**: the tomography flyscan, dark/flat calibration frames, and
//!   standalone trigger-unit and camera acquisitions
//!
//! # Example
//!
//! ```rust,ignore
//! use flyscan_experiment::{abort_channel, plans, PlanContext, TimingPlanner};
//!
//! let (handle, signal) = abort_channel();
//! let ctx = PlanContext::new(TimingPlanner::default(), DrainSettings::default())
//!     .with_abort(signal);
//! let report = plans::tomo_flyscan(&instrument, &spec, &ctx, &mut session).await?;
//! ```

pub mod abort;
pub mod completion;
pub mod coordinator;
pub mod finalizer;
pub mod planner;
pub mod plans;

pub use abort::{abort_channel, AbortHandle, AbortSignal};
pub use completion::{drain_until_complete, CompletionGroup, DrainReport, DrainSettings, StreamCollector, WaitStatus};
pub use coordinator::{LifecycleCoordinator, LifecycleState, Participant, ParticipantSet};
pub use finalizer::{AsyncCleanupFn, Finalizer};
pub use planner::{plan, PlannerLimits, TimingPlanner};
pub use plans::{CameraUnit, PandaUnit, PlanContext, TomoInstrument, TriggerPair};
