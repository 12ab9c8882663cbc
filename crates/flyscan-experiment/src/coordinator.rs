//! Multi-device lifecycle coordinator.
//!
//! Drives `stage → prepare → kickoff → complete → collect → unstage` across
//! the participants of one scan: a rotation axis, a trigger unit and any
//! number of cameras.
//!
//! # Guarantees
//!
//! - `stage_all` is all-or-nothing. A failure unstages whatever was already
//!   staged, in reverse order, before the error propagates.
//! - `stage_all` never stages over a device another run still holds.
//! - Every hardware call is raced against the abort signal.
//! - `finish` always unstages and runs the finalizer exactly once, whatever
//!   the outcome, and reports unstage failures behind the primary error.
//! - `unstage_all` on a set with nothing staged is a no-op that touches no
//!   hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut coordinator = LifecycleCoordinator::new(participants, settings, abort)?;
//! let outcome = async {
//!     coordinator.stage_all().await?;
//!     coordinator.prepare("panda_flyer", 1801u32, true).await?;
//!     coordinator.kickoff_all().await?;
//!     coordinator.complete("panda_flyer", "complete")?;
//!     coordinator.drain("complete", &["panda_detector"]).await
//! }
//! .await;
//! coordinator.finish(outcome).await?;
//! ```

use crate::abort::AbortSignal;
use crate::completion::{drain_until_complete, CompletionGroup, DrainReport, DrainSettings, StreamCollector};
use crate::finalizer::{AsyncCleanupFn, Finalizer};
use flyscan_core::capabilities::{
    Collectable, Completable, Kickoffable, MotionAxis, Movable, Preparable, Stageable, VelocityControl,
};
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase, UnstageFailure};
use flyscan_core::timing::TriggerSchedule;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PREPARE_GROUP: &str = "prepare";

// =============================================================================
// Lifecycle State
// =============================================================================

/// Where a scan is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing staged yet.
    Idle,
    /// Every participant staged.
    Staged,
    /// At least one participant prepared.
    Prepared,
    /// Participants kicked off.
    Acquiring,
    /// Completion waits registered.
    Completing,
    /// Every completion group drained.
    Collected,
    /// Everything unstaged.
    Unstaged,
    /// An abort is being handled.
    Aborting,
}

impl LifecycleState {
    /// Whether a new scan may begin from this state.
    pub fn can_begin(self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Unstaged)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Staged => "staged",
            LifecycleState::Prepared => "prepared",
            LifecycleState::Acquiring => "acquiring",
            LifecycleState::Completing => "completing",
            LifecycleState::Collected => "collected",
            LifecycleState::Unstaged => "unstaged",
            LifecycleState::Aborting => "aborting",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParticipantPhase {
    Idle,
    Staged,
    Prepared,
    KickedOff,
    Completing,
}

// =============================================================================
// Participants
// =============================================================================

/// Capability set of one participant.
///
/// Each capability is optional; a participant only offers what its device
/// supports. `prepare` is generic over the value the device is prepared
/// with, so it is stored type-erased and recovered by type at call time.
#[derive(Clone)]
pub struct Participant {
    name: String,
    stage: Option<Arc<dyn Stageable>>,
    prepare: Option<Arc<dyn Any + Send + Sync>>,
    prepare_type: &'static str,
    kickoff: Option<Arc<dyn Kickoffable>>,
    complete: Option<Arc<dyn Completable>>,
    collect: Option<Arc<dyn Collectable>>,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl Participant {
    /// Participant with no capabilities yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: None,
            prepare: None,
            prepare_type: "",
            kickoff: None,
            complete: None,
            collect: None,
        }
    }

    /// Stage, prepare, kickoff and complete from one device.
    pub fn acquirer<T, D>(name: impl Into<String>, device: Arc<D>) -> Self
    where
        T: Send + 'static,
        D: flyscan_core::capabilities::Acquirer<T> + 'static,
    {
        Self::new(name)
            .with_stage(device.clone())
            .with_prepare::<T>(device.clone())
            .with_kickoff(device.clone())
            .with_complete(device)
    }

    /// Add the stage/unstage capability.
    pub fn with_stage(mut self, stage: Arc<dyn Stageable>) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Add the prepare capability for values of type `T`.
    pub fn with_prepare<T: Send + 'static>(mut self, prepare: Arc<dyn Preparable<T>>) -> Self {
        self.prepare = Some(Arc::new(prepare));
        self.prepare_type = std::any::type_name::<T>();
        self
    }

    /// Add the kickoff capability.
    pub fn with_kickoff(mut self, kickoff: Arc<dyn Kickoffable>) -> Self {
        self.kickoff = Some(kickoff);
        self
    }

    /// Add the complete capability.
    pub fn with_complete(mut self, complete: Arc<dyn Completable>) -> Self {
        self.complete = Some(complete);
        self
    }

    /// Add the collect capability.
    pub fn with_collect(mut self, collect: Arc<dyn Collectable>) -> Self {
        self.collect = Some(collect);
        self
    }

    /// Participant name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the capabilities offered.
    pub fn capabilities(&self) -> Vec<&'static str> {
        [
            ("stage", self.stage.is_some()),
            ("prepare", self.prepare.is_some()),
            ("kickoff", self.kickoff.is_some()),
            ("complete", self.complete.is_some()),
            ("collect", self.collect.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, offered)| offered.then_some(name))
        .collect()
    }

    fn preparable<T: Send + 'static>(&self) -> Option<Arc<dyn Preparable<T>>> {
        self.prepare
            .as_ref()?
            .downcast_ref::<Arc<dyn Preparable<T>>>()
            .cloned()
    }
}

/// Participants of one scan, in declared order, plus the ones known absent.
#[derive(Debug, Clone, Default)]
pub struct ParticipantSet {
    participants: Vec<Participant>,
    absent: Vec<String>,
}

impl ParticipantSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. Declaration order is kickoff order.
    pub fn with(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    /// Declare a participant absent.
    pub fn with_absent(mut self, name: impl Into<String>) -> Self {
        self.absent.push(name.into());
        self
    }

    /// Add `participant` when present, otherwise declare `name` absent.
    pub fn with_optional(self, name: impl Into<String>, participant: Option<Participant>) -> Self {
        match participant {
            Some(participant) => self.with(participant),
            None => self.with_absent(name),
        }
    }

    /// Present participant names in declared order.
    pub fn names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name()).collect()
    }

    /// Absent participant names.
    pub fn absent(&self) -> &[String] {
        &self.absent
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct Entry {
    participant: Participant,
    phase: ParticipantPhase,
}

struct MotionRun {
    name: String,
    axis: Arc<dyn MotionAxis>,
    run_out: f64,
    kicked_off: bool,
}

/// Race `call` against the abort signal and attribute failures.
async fn guarded<T, F>(abort: &AbortSignal, participant: &str, phase: Phase, call: F) -> FlyscanResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    abort.check()?;
    tokio::select! {
        biased;
        reason = abort.aborted() => Err(FlyscanError::Aborted(reason)),
        result = call => result.map_err(|e| FlyscanError::participant(participant, phase, e)),
    }
}

/// Drives the lifecycle of a [`ParticipantSet`].
pub struct LifecycleCoordinator {
    run_id: Uuid,
    state: LifecycleState,
    entries: Vec<Entry>,
    absent: Vec<String>,
    staged: Vec<usize>,
    groups: BTreeMap<String, CompletionGroup>,
    pending_prepares: CompletionGroup,
    motion: Option<MotionRun>,
    finalizer: Finalizer,
    settings: DrainSettings,
    abort: AbortSignal,
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("participants", &self.participant_names())
            .field("absent", &self.absent)
            .field("finalizer", &self.finalizer)
            .finish()
    }
}

impl LifecycleCoordinator {
    /// Coordinator for `set`. Participant names must be unique.
    pub fn new(set: ParticipantSet, settings: DrainSettings, abort: AbortSignal) -> FlyscanResult<Self> {
        let mut seen = HashSet::new();
        for name in set.participants.iter().map(|p| p.name()).chain(set.absent.iter().map(String::as_str)) {
            if !seen.insert(name.to_string()) {
                return Err(FlyscanError::Configuration(format!(
                    "Participant '{}' declared more than once",
                    name
                )));
            }
        }
        for name in &set.absent {
            warn!(participant = %name, "Participant absent, continuing without it");
        }

        Ok(Self {
            run_id: Uuid::new_v4(),
            state: LifecycleState::Idle,
            entries: set
                .participants
                .into_iter()
                .map(|participant| Entry {
                    participant,
                    phase: ParticipantPhase::Idle,
                })
                .collect(),
            absent: set.absent,
            staged: Vec::new(),
            groups: BTreeMap::new(),
            pending_prepares: CompletionGroup::new(PREPARE_GROUP).with_phase(Phase::Prepare),
            motion: None,
            finalizer: Finalizer::new(),
            settings,
            abort,
        })
    }

    /// Correlation id of the current run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Present participants in declared order.
    pub fn participant_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.participant.name()).collect()
    }

    /// Participants declared absent.
    pub fn absent(&self) -> &[String] {
        &self.absent
    }

    /// Whether `name` takes part in this scan.
    pub fn is_present(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.participant.name() == name)
    }

    /// Abort signal observed by every call.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Drain loop timing.
    pub fn settings(&self) -> &DrainSettings {
        &self.settings
    }

    /// Register a cleanup action run by [`finish`](Self::finish).
    pub fn register_finalizer(&mut self, name: impl Into<String>, action: AsyncCleanupFn) {
        self.finalizer.register(name, action);
    }

    fn transition(&mut self, to: LifecycleState) {
        if self.state != to {
            info!(run_id = %self.run_id, from = %self.state, to = %to, "Lifecycle transition");
            self.state = to;
        }
    }

    fn index_of(&self, name: &str) -> FlyscanResult<usize> {
        if let Some(idx) = self.entries.iter().position(|e| e.participant.name() == name) {
            return Ok(idx);
        }
        if self.absent.iter().any(|a| a == name) {
            return Err(FlyscanError::InvalidState(format!(
                "Participant '{}' was declared absent",
                name
            )));
        }
        Err(FlyscanError::InvalidState(format!("Unknown participant '{}'", name)))
    }

    /// Run a hardware call on behalf of `participant`, raced against abort.
    pub async fn call<T, F>(&self, participant: &str, phase: Phase, call: F) -> FlyscanResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        guarded(&self.abort, participant, phase, call).await
    }

    /// Refuse to stage over a device another run still holds.
    ///
    /// Devices that cannot report their staging state are assumed free.
    async fn ensure_unclaimed(&self) -> FlyscanResult<()> {
        for entry in &self.entries {
            let Some(stage) = entry.participant.stage.clone() else {
                continue;
            };
            let name = entry.participant.name();
            match guarded(&self.abort, name, Phase::Stage, stage.is_staged()).await {
                Ok(true) => {
                    return Err(FlyscanError::InvalidState(format!(
                        "'{}' is already staged by another run",
                        name
                    )))
                }
                Ok(false) => {}
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => debug!(participant = %name, error = %e, "Staging state unknown"),
            }
        }
        Ok(())
    }

    /// Stage every participant in declared order.
    ///
    /// Re-entry while anything is staged is an `InvalidState` error and
    /// leaves the state untouched, as is staging a device that another
    /// run already holds. Neither case sends a stage command.
    pub async fn stage_all(&mut self) -> FlyscanResult<()> {
        if !self.state.can_begin() {
            return Err(FlyscanError::InvalidState(format!(
                "stage_all called while {}",
                self.state
            )));
        }
        self.abort.check()?;
        self.ensure_unclaimed().await?;
        self.run_id = Uuid::new_v4();
        info!(run_id = %self.run_id, participants = ?self.participant_names(), "Staging participants");

        for idx in 0..self.entries.len() {
            let entry = &self.entries[idx];
            let name = entry.participant.name().to_string();
            if let Some(stage) = entry.participant.stage.clone() {
                if let Err(e) = guarded(&self.abort, &name, Phase::Stage, stage.stage()).await {
                    warn!("Stage failed for {}: {}, cleaning up", name, e);
                    let failures = self.unstage_staged().await;
                    self.transition(LifecycleState::Unstaged);
                    return Err(e.with_unstage_errors(failures));
                }
            }
            self.entries[idx].phase = ParticipantPhase::Staged;
            self.staged.push(idx);
            info!("Staged participant: {}", name);
        }

        self.transition(LifecycleState::Staged);
        Ok(())
    }

    /// Configure the motion axis for the sweep.
    ///
    /// Restoring the reset velocity is registered with the finalizer before
    /// any command is sent. Then: reset velocity, blocking move to the
    /// run-up position, scan velocity. Kickoff later moves to the run-out
    /// position without waiting.
    pub async fn prepare_motion(
        &mut self,
        name: &str,
        axis: Arc<dyn MotionAxis>,
        schedule: &TriggerSchedule,
    ) -> FlyscanResult<()> {
        if !matches!(
            self.state,
            LifecycleState::Idle | LifecycleState::Unstaged | LifecycleState::Staged | LifecycleState::Prepared
        ) {
            return Err(FlyscanError::InvalidState(format!(
                "prepare_motion called while {}",
                self.state
            )));
        }
        if self.motion.is_some() {
            return Err(FlyscanError::InvalidState(format!(
                "Motion already prepared for this run ({})",
                name
            )));
        }

        let reset_speed = schedule.reset_speed;
        let restore = axis.clone();
        self.finalizer.register(
            format!("{}_restore_velocity", name),
            Box::new(move || async move { restore.set_velocity(reset_speed).await }.boxed()),
        );

        // Recorded before the run-up move so an abort mid-move still stops the axis
        self.motion = Some(MotionRun {
            name: name.to_string(),
            axis: axis.clone(),
            run_out: schedule.run_out_position,
            kicked_off: false,
        });

        guarded(&self.abort, name, Phase::Setup, axis.set_velocity(reset_speed)).await?;
        guarded(&self.abort, name, Phase::Setup, axis.move_abs(schedule.run_up_position)).await?;
        guarded(&self.abort, name, Phase::Setup, axis.wait_settled()).await?;
        guarded(&self.abort, name, Phase::Setup, axis.set_velocity(schedule.velocity)).await?;
        info!(
            axis = %name,
            run_up = schedule.run_up_position,
            run_out = schedule.run_out_position,
            velocity = schedule.velocity,
            "Motion prepared"
        );
        Ok(())
    }

    /// Prepare one participant with `value`.
    ///
    /// With `wait` false the prepare runs in the background and is settled
    /// before kickoff.
    pub async fn prepare<T: Send + 'static>(&mut self, name: &str, value: T, wait: bool) -> FlyscanResult<()> {
        let idx = self.index_of(name)?;
        if !matches!(self.state, LifecycleState::Staged | LifecycleState::Prepared) {
            return Err(FlyscanError::InvalidState(format!(
                "Cannot prepare '{}' while {}",
                name, self.state
            )));
        }
        let entry = &self.entries[idx];
        if !matches!(entry.phase, ParticipantPhase::Staged | ParticipantPhase::Prepared) {
            return Err(FlyscanError::InvalidState(format!(
                "Cannot prepare '{}' in phase {:?}",
                name, entry.phase
            )));
        }
        let Some(preparable) = entry.participant.preparable::<T>() else {
            return Err(FlyscanError::InvalidState(format!(
                "'{}' cannot be prepared with {} (expects {})",
                name,
                std::any::type_name::<T>(),
                if entry.participant.prepare_type.is_empty() {
                    "nothing"
                } else {
                    entry.participant.prepare_type
                }
            )));
        };

        if wait {
            guarded(&self.abort, name, Phase::Prepare, preparable.prepare(value)).await?;
        } else {
            self.pending_prepares
                .add(name, async move { preparable.prepare(value).await });
        }
        self.entries[idx].phase = ParticipantPhase::Prepared;
        debug!(participant = %name, wait, "Prepared participant");
        if self.state == LifecycleState::Staged {
            self.transition(LifecycleState::Prepared);
        }
        Ok(())
    }

    /// Kick off every participant in declared order, then start the sweep.
    ///
    /// No kickoff waits for the previous participant to finish acquiring.
    pub async fn kickoff_all(&mut self) -> FlyscanResult<()> {
        if !matches!(self.state, LifecycleState::Staged | LifecycleState::Prepared) {
            return Err(FlyscanError::InvalidState(format!(
                "kickoff_all called while {}",
                self.state
            )));
        }

        if !self.pending_prepares.is_empty() {
            let mut pending = std::mem::replace(
                &mut self.pending_prepares,
                CompletionGroup::new(PREPARE_GROUP).with_phase(Phase::Prepare),
            );
            drain_until_complete(&mut pending, &self.settings, &[], &self.abort).await?;
        }

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.participant.prepare.is_some() && e.phase != ParticipantPhase::Prepared)
        {
            return Err(FlyscanError::InvalidState(format!(
                "'{}' must be prepared before kickoff",
                entry.participant.name()
            )));
        }

        self.transition(LifecycleState::Acquiring);
        for idx in 0..self.entries.len() {
            let Some(kickoff) = self.entries[idx].participant.kickoff.clone() else {
                continue;
            };
            let name = self.entries[idx].participant.name().to_string();
            guarded(&self.abort, &name, Phase::Kickoff, kickoff.kickoff()).await?;
            self.entries[idx].phase = ParticipantPhase::KickedOff;
            debug!("Kicked off participant: {}", name);
        }

        if let Some(motion) = self.motion.as_mut() {
            guarded(
                &self.abort,
                &motion.name,
                Phase::Kickoff,
                motion.axis.move_abs(motion.run_out),
            )
            .await?;
            motion.kicked_off = true;
            info!(axis = %motion.name, target = motion.run_out, "Sweep started");
        }
        Ok(())
    }

    fn group_mut(&mut self, group: &str) -> &mut CompletionGroup {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| CompletionGroup::new(group))
    }

    /// Register `name`'s completion in `group`.
    pub fn complete(&mut self, name: &str, group: &str) -> FlyscanResult<()> {
        let idx = self.index_of(name)?;
        let entry = &self.entries[idx];
        if entry.phase != ParticipantPhase::KickedOff {
            return Err(FlyscanError::InvalidState(format!(
                "complete called for '{}' before kickoff",
                name
            )));
        }
        let Some(completable) = entry.participant.complete.clone() else {
            return Err(FlyscanError::InvalidState(format!(
                "'{}' cannot be completed",
                name
            )));
        };
        self.group_mut(group)
            .add(name, async move { completable.complete().await });
        self.entries[idx].phase = ParticipantPhase::Completing;
        if self.state == LifecycleState::Acquiring {
            self.transition(LifecycleState::Completing);
        }
        Ok(())
    }

    /// Register the end of the sweep in `group`.
    pub fn complete_motion(&mut self, group: &str) -> FlyscanResult<()> {
        let (name, axis) = match &self.motion {
            Some(motion) if motion.kicked_off => (motion.name.clone(), motion.axis.clone()),
            _ => {
                return Err(FlyscanError::InvalidState(
                    "complete_motion called before the sweep started".into(),
                ))
            }
        };
        self.group_mut(group)
            .add(name, async move { axis.wait_settled().await });
        Ok(())
    }

    /// Poll `group` until complete, draining `collectors` between polls.
    pub async fn drain(&mut self, group: &str, collectors: &[&str]) -> FlyscanResult<DrainReport> {
        let collectors = collectors
            .iter()
            .map(|name| {
                let idx = self.index_of(name)?;
                match self.entries[idx].participant.collect.clone() {
                    Some(source) => Ok(StreamCollector::new(*name, source)),
                    None => Err(FlyscanError::InvalidState(format!(
                        "'{}' cannot be collected",
                        name
                    ))),
                }
            })
            .collect::<FlyscanResult<Vec<_>>>()?;

        let Some(mut completion) = self.groups.remove(group) else {
            return Err(FlyscanError::InvalidState(format!(
                "No completion group '{}'",
                group
            )));
        };
        let report = drain_until_complete(&mut completion, &self.settings, &collectors, &self.abort).await?;
        if self.groups.is_empty() {
            self.transition(LifecycleState::Collected);
        }
        Ok(report)
    }

    async fn unstage_staged(&mut self) -> Vec<UnstageFailure> {
        self.groups.clear();
        self.pending_prepares = CompletionGroup::new(PREPARE_GROUP).with_phase(Phase::Prepare);

        let mut failures = Vec::new();
        // Unstage in reverse order
        while let Some(idx) = self.staged.pop() {
            let entry = &mut self.entries[idx];
            entry.phase = ParticipantPhase::Idle;
            let name = entry.participant.name().to_string();
            let Some(stage) = entry.participant.stage.clone() else {
                continue;
            };
            match stage.unstage().await {
                Ok(()) => info!("Unstaged participant: {}", name),
                Err(e) => {
                    error!("Unstage failed for {}: {:#}", name, e);
                    failures.push(UnstageFailure::unstage(name, &e));
                }
            }
        }
        failures
    }

    /// Unstage every staged participant in reverse order.
    ///
    /// Every participant is attempted even after a failure; failures are
    /// reported together. With nothing staged this is a no-op.
    pub async fn unstage_all(&mut self) -> FlyscanResult<()> {
        if self.staged.is_empty() {
            debug!(run_id = %self.run_id, "Nothing staged, unstage_all is a no-op");
            if !self.state.can_begin() {
                self.transition(LifecycleState::Unstaged);
            }
            return Ok(());
        }
        let failures = self.unstage_staged().await;
        self.transition(LifecycleState::Unstaged);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlyscanError::Unstage(failures))
        }
    }

    async fn stop_motion(&mut self) {
        let Some(motion) = self.motion.as_ref() else {
            return;
        };
        match motion.axis.stop().await {
            Ok(()) if motion.kicked_off => info!(axis = %motion.name, "Sweep stopped"),
            Ok(()) => info!(axis = %motion.name, "Run-up move stopped"),
            Err(e) => warn!(axis = %motion.name, error = %e, "Could not stop sweep"),
        }
    }

    /// End the run: unstage everything, run the finalizer, report.
    ///
    /// The primary outcome is preserved; unstage and cleanup failures are
    /// attached behind it, or reported on their own after a success.
    pub async fn finish<T>(&mut self, outcome: FlyscanResult<T>) -> FlyscanResult<T> {
        if let Err(e) = &outcome {
            if e.is_abort() {
                self.transition(LifecycleState::Aborting);
            } else {
                error!(run_id = %self.run_id, error = %e, "Scan failed, cleaning up");
            }
            self.stop_motion().await;
        }

        let mut failures = if self.staged.is_empty() {
            Vec::new()
        } else {
            self.unstage_staged().await
        };
        self.transition(LifecycleState::Unstaged);
        failures.extend(self.finalizer.run().await);
        self.finalizer = Finalizer::new();
        self.motion = None;

        match outcome {
            Ok(value) if failures.is_empty() => {
                info!(run_id = %self.run_id, "Run finished");
                Ok(value)
            }
            Ok(_) => Err(FlyscanError::Unstage(failures)),
            Err(e) => Err(e.with_unstage_errors(failures)),
        }
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            // Can't call async in drop, log error
            error!(
                "LifecycleCoordinator dropped without finish()! {} participants may still be staged: {:?}",
                self.staged.len(),
                self.staged
                    .iter()
                    .map(|&idx| self.entries[idx].participant.name())
                    .collect::<Vec<_>>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::abort_channel;
    use crate::planner::{plan, PlannerLimits};
    use flyscan_core::capabilities::ShutterControl;
    use flyscan_core::readout::{FramerateTable, ReadoutMode};
    use flyscan_core::timing::ScanTimingSpec;
    use flyscan_core::trigger::{DetectorTrigger, TriggerInfo};
    use flyscan_driver_mock::{
        ErrorConfig, ErrorScenario, MockDetector, MockMode, MockRotaryAxis, MockShutter, TriggerLine,
    };
    use std::time::Duration;

    fn detector(name: &str, line: &TriggerLine) -> Arc<MockDetector> {
        Arc::new(MockDetector::builder(name, line.clone()).build())
    }

    fn failing(name: &str, line: &TriggerLine, operation: &'static str) -> Arc<MockDetector> {
        Arc::new(
            MockDetector::builder(name, line.clone())
                .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN { operation, count: 0 }))
                .build(),
        )
    }

    fn participant(detector: &Arc<MockDetector>) -> Participant {
        Participant::acquirer::<TriggerInfo, _>(detector.name(), detector.clone()).with_collect(detector.clone())
    }

    fn coordinator(set: ParticipantSet) -> LifecycleCoordinator {
        LifecycleCoordinator::new(set, DrainSettings::default(), AbortSignal::never()).unwrap()
    }

    fn edge_triggers(num: u32) -> TriggerInfo {
        TriggerInfo {
            num,
            trigger: DetectorTrigger::EdgeTrigger,
            deadtime: 0.0,
            livetime: 0.01,
        }
    }

    #[tokio::test]
    async fn test_stage_all_rejects_reentry() {
        let line = TriggerLine::new("test");
        let camera = detector("camera", &line);
        let mut coordinator = coordinator(ParticipantSet::new().with(participant(&camera)));

        coordinator.stage_all().await.unwrap();
        let err = coordinator.stage_all().await.unwrap_err();
        assert!(matches!(err, FlyscanError::InvalidState(_)));
        assert_eq!(coordinator.state(), LifecycleState::Staged);
        assert!(camera.staged());

        coordinator.finish(Ok(())).await.unwrap();
        assert!(!camera.staged());
        assert_eq!(coordinator.state(), LifecycleState::Unstaged);
    }

    #[tokio::test]
    async fn test_stage_all_refuses_device_held_by_another_run() {
        let line = TriggerLine::new("test");
        let camera = detector("camera", &line);
        let panda = detector("panda", &line);
        let mut first = coordinator(ParticipantSet::new().with(participant(&camera)));
        first.stage_all().await.unwrap();

        let mut second = coordinator(
            ParticipantSet::new()
                .with(participant(&panda))
                .with(participant(&camera)),
        );
        let err = second.stage_all().await.unwrap_err();
        assert!(matches!(err, FlyscanError::InvalidState(_)), "unexpected error: {err}");
        assert!(err.to_string().contains("camera"));
        assert_eq!(second.state(), LifecycleState::Idle);
        assert!(!panda.staged());

        // The holder is untouched and the device frees up once it finishes
        assert!(camera.staged());
        first.finish(Ok(())).await.unwrap();
        second.stage_all().await.unwrap();
        assert!(camera.staged());
        second.finish(Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_failure_rolls_back_staged_participants() {
        let line = TriggerLine::new("test");
        let first = detector("first", &line);
        let second = detector("second", &line);
        let broken = failing("broken", &line, "stage");
        let set = ParticipantSet::new()
            .with(participant(&first))
            .with(participant(&second))
            .with(participant(&broken));
        let mut coordinator = coordinator(set);

        let err = coordinator.stage_all().await.unwrap_err();
        match err {
            FlyscanError::Participant { participant, phase, .. } => {
                assert_eq!(participant, "broken");
                assert_eq!(phase, Phase::Stage);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!first.staged());
        assert!(!second.staged());
        assert_eq!(coordinator.state(), LifecycleState::Unstaged);

        // A fresh run may begin after the rollback
        assert!(coordinator.unstage_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_unstage_all_without_stage_touches_no_hardware() {
        let line = TriggerLine::new("test");
        let camera = failing("camera", &line, "unstage");
        let mut coordinator = coordinator(ParticipantSet::new().with(participant(&camera)));

        coordinator.unstage_all().await.unwrap();
        coordinator.unstage_all().await.unwrap();
        assert_eq!(coordinator.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_unstage_attempts_every_participant() {
        let line = TriggerLine::new("test");
        let first = failing("first", &line, "unstage");
        let second = failing("second", &line, "unstage");
        let set = ParticipantSet::new().with(participant(&first)).with(participant(&second));
        let mut coordinator = coordinator(set);

        coordinator.stage_all().await.unwrap();
        match coordinator.unstage_all().await.unwrap_err() {
            FlyscanError::Unstage(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.participant.as_str()).collect();
                assert_eq!(names, vec!["second", "first"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.state(), LifecycleState::Unstaged);
    }

    #[tokio::test]
    async fn test_primary_error_keeps_unstage_failures() {
        let line = TriggerLine::new("test");
        let camera = failing("camera", &line, "unstage");
        let mut coordinator = coordinator(ParticipantSet::new().with(participant(&camera)));

        coordinator.register_finalizer(
            "close_shutter",
            Box::new(|| async { Err::<(), _>(anyhow::anyhow!("shutter jammed")) }.boxed()),
        );
        coordinator.stage_all().await.unwrap();
        let outcome: FlyscanResult<()> = Err(FlyscanError::Precondition("front-end shutter closed".into()));
        let err = coordinator.finish(outcome).await.unwrap_err();

        assert!(matches!(err.primary(), FlyscanError::Precondition(_)));
        match err {
            FlyscanError::WithUnstageErrors { unstage_errors, .. } => {
                let labels: Vec<_> = unstage_errors
                    .iter()
                    .map(|f| (f.participant.as_str(), f.phase))
                    .collect();
                assert_eq!(
                    labels,
                    vec![("camera", Phase::Unstage), ("close_shutter", Phase::Finalize)]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_participants_rejected() {
        let line = TriggerLine::new("test");
        let camera = detector("camera", &line);
        let set = ParticipantSet::new()
            .with(participant(&camera))
            .with_absent("camera");
        let err = LifecycleCoordinator::new(set, DrainSettings::default(), AbortSignal::never()).unwrap_err();
        assert!(matches!(err, FlyscanError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_absent_participant_is_skipped() {
        let line = TriggerLine::new("test");
        let panda = detector("panda", &line);
        let set = ParticipantSet::new()
            .with(participant(&panda))
            .with_optional("kinetix", None);
        let mut coordinator = coordinator(set);
        assert_eq!(coordinator.participant_names(), vec!["panda"]);
        assert!(!coordinator.is_present("kinetix"));

        coordinator.stage_all().await.unwrap();
        let err = coordinator.prepare("kinetix", edge_triggers(3), true).await.unwrap_err();
        assert!(err.to_string().contains("absent"));

        coordinator.prepare("panda", edge_triggers(3), true).await.unwrap();
        coordinator.kickoff_all().await.unwrap();
        line.fire(0, 3);
        coordinator.complete("panda", "complete").unwrap();
        let report = coordinator.drain("complete", &["panda"]).await.unwrap();
        assert_eq!(report.frames_for("panda"), 3);
        coordinator.finish(Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_misuse_is_invalid_state() {
        let line = TriggerLine::new("test");
        let camera = detector("camera", &line);
        let mut coordinator = coordinator(ParticipantSet::new().with(participant(&camera)));

        let err = coordinator.prepare("camera", edge_triggers(3), true).await.unwrap_err();
        assert!(matches!(err, FlyscanError::InvalidState(_)));

        coordinator.stage_all().await.unwrap();
        let err = coordinator.complete("camera", "complete").unwrap_err();
        assert!(matches!(err, FlyscanError::InvalidState(_)));

        let err = coordinator.kickoff_all().await.unwrap_err();
        assert!(err.to_string().contains("must be prepared"));

        let err = coordinator.prepare("camera", 3u32, true).await.unwrap_err();
        assert!(err.to_string().contains("cannot be prepared"));

        coordinator.finish(Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_background_prepare_settles_before_kickoff() {
        let line = TriggerLine::new("test");
        let camera = detector("camera", &line);
        let mut coordinator = coordinator(ParticipantSet::new().with(participant(&camera)));

        coordinator.stage_all().await.unwrap();
        coordinator.prepare("camera", edge_triggers(2), false).await.unwrap();
        coordinator.kickoff_all().await.unwrap();
        line.fire(0, 2);
        coordinator.complete("camera", "complete").unwrap();
        let report = coordinator.drain("complete", &["camera"]).await.unwrap();
        assert!(report.counts_agree());
        assert_eq!(coordinator.state(), LifecycleState::Collected);
        coordinator.finish(Ok(())).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_run_up_stops_axis() {
        let axis = Arc::new(
            MockRotaryAxis::builder()
                .initial_position(100.0)
                .mode(MockMode::Realistic)
                .build(),
        );
        let (handle, signal) = abort_channel();
        let mut coordinator =
            LifecycleCoordinator::new(ParticipantSet::new(), DrainSettings::default(), signal).unwrap();

        let spec = ScanTimingSpec::default()
            .with_range(0.0, 18.0)
            .with_num_images(91)
            .with_exposure(Some(0.01))
            .with_scan_time(Some(2.0))
            .with_lead_angle(2.0);
        let schedule = plan(
            &spec,
            &PlannerLimits::default(),
            &FramerateTable::default(),
            ReadoutMode::Sensitivity,
        )
        .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.abort("operator stop");
        });
        let outcome = coordinator.prepare_motion("rotation", axis.clone(), &schedule).await;
        assert!(matches!(outcome, Err(FlyscanError::Aborted(_))));
        assert!(axis.is_moving());

        let err = coordinator.finish(outcome).await.unwrap_err();
        assert!(err.is_abort());
        assert!(!axis.is_moving());
        let stopped_at = axis.current_position();
        assert!(stopped_at > schedule.run_up_position && stopped_at < 100.0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(axis.current_position(), stopped_at);
        // Reset speed, then restored by the finalizer; the scan speed was never set
        assert_eq!(axis.velocity_history(), vec![30.0, 30.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_drain_cleans_up_once() {
        let line = TriggerLine::new("never_fired");
        let camera = detector("camera", &line);
        let axis = Arc::new(MockRotaryAxis::builder().mode(MockMode::Realistic).build());
        let shutter = Arc::new(MockShutter::new("shutter").with_open(true));
        let (handle, signal) = abort_channel();
        let mut coordinator = LifecycleCoordinator::new(
            ParticipantSet::new().with(participant(&camera)),
            DrainSettings::default(),
            signal,
        )
        .unwrap();

        let spec = ScanTimingSpec::default()
            .with_range(0.0, 18.0)
            .with_num_images(91)
            .with_exposure(Some(0.01))
            .with_scan_time(Some(2.0))
            .with_lead_angle(2.0);
        let schedule = plan(
            &spec,
            &PlannerLimits::default(),
            &FramerateTable::default(),
            ReadoutMode::Sensitivity,
        )
        .unwrap();

        let close = shutter.clone();
        coordinator.register_finalizer(
            "close_shutter",
            Box::new(move || async move { close.close().await }.boxed()),
        );

        let outcome = async {
            coordinator.prepare_motion("rotation", axis.clone(), &schedule).await?;
            coordinator.stage_all().await?;
            coordinator.prepare("camera", edge_triggers(91), true).await?;
            coordinator.kickoff_all().await?;
            coordinator.complete("camera", "complete")?;
            coordinator.complete_motion("complete")?;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1200)).await;
                handle.abort("operator stop");
            });
            coordinator.drain("complete", &["camera"]).await
        }
        .await;
        assert!(matches!(outcome, Err(FlyscanError::Aborted(_))));

        let err = coordinator.finish(outcome).await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(shutter.close_commands(), 1);
        assert_eq!(axis.velocity_history(), vec![30.0, 9.0, 30.0]);
        assert!(!camera.staged());
        assert_eq!(coordinator.state(), LifecycleState::Unstaged);

        // Cleanup ran once
        coordinator.finish(Ok(())).await.unwrap();
        assert_eq!(shutter.close_commands(), 1);
    }
}
