//! Completion groups and the drain loop.
//!
//! A [`CompletionGroup`] holds in-flight completion waits under a group
//! name. [`drain_until_complete`] polls the group with a short timeout and
//! drains every collector between polls, so data streams out while the
//! hardware is still acquiring. A poll timeout is the normal case; only the
//! bounded number of polls turns it into an error.

use crate::abort::AbortSignal;
use flyscan_core::capabilities::Collectable;
use flyscan_core::error::{FlyscanError, FlyscanResult, Phase};
use flyscan_core::limits::{DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Completion Group
// =============================================================================

struct Member {
    name: String,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

/// Result of one bounded wait on a group.
#[derive(Debug)]
pub enum WaitStatus {
    /// Every member finished successfully.
    Complete,
    /// The wait timed out; these members are still running.
    TimedOut {
        /// Members still running.
        pending: Vec<String>,
    },
    /// A member finished with an error.
    Failed {
        /// Failing member.
        member: String,
        /// What went wrong.
        error: anyhow::Error,
    },
}

/// Named set of in-flight completion waits.
pub struct CompletionGroup {
    name: String,
    phase: Phase,
    members: Vec<Member>,
}

impl std::fmt::Debug for CompletionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGroup")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("pending", &self.pending())
            .finish()
    }
}

impl CompletionGroup {
    /// Empty group whose failures are reported as completion failures.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Complete,
            members: Vec::new(),
        }
    }

    /// Report member failures under `phase` instead.
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Phase member failures are reported under.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Start waiting on `wait` as member `name`.
    ///
    /// The wait runs on its own task so members progress independently of
    /// how often the group is polled.
    pub fn add<F>(&mut self, name: impl Into<String>, wait: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(group = %self.name, member = %name, "Completion registered");
        self.members.push(Member {
            name,
            handle: Some(tokio::spawn(wait)),
        });
    }

    /// Number of members, finished or not.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members still running.
    pub fn pending(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.handle.is_some())
            .map(|m| m.name.clone())
            .collect()
    }

    /// Whether every member has finished.
    pub fn is_complete(&self) -> bool {
        self.members.iter().all(|m| m.handle.is_none())
    }

    /// Wait up to `limit` for every member to finish.
    ///
    /// Members that finish are retired even when the wait as a whole times
    /// out. The first failing member ends the wait.
    pub async fn wait(&mut self, limit: Duration) -> WaitStatus {
        let deadline = Instant::now() + limit;
        for member in &mut self.members {
            let Some(handle) = member.handle.as_mut() else {
                continue;
            };
            // Timeout polls the handle before the deadline, so members that
            // are already done are harvested even past the deadline.
            match timeout_at(deadline, handle).await {
                Err(_) => continue,
                Ok(joined) => {
                    member.handle = None;
                    let outcome = match joined {
                        Ok(result) => result,
                        Err(e) => Err(anyhow::anyhow!("completion task ended abnormally: {}", e)),
                    };
                    if let Err(error) = outcome {
                        return WaitStatus::Failed {
                            member: member.name.clone(),
                            error,
                        };
                    }
                    debug!(group = %self.name, member = %member.name, "Completion finished");
                }
            }
        }

        if self.is_complete() {
            WaitStatus::Complete
        } else {
            WaitStatus::TimedOut {
                pending: self.pending(),
            }
        }
    }

    /// Cancel every running wait.
    pub fn cancel(&mut self) {
        for member in &mut self.members {
            if let Some(handle) = member.handle.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for CompletionGroup {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Drain Loop
// =============================================================================

/// Timing of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSettings {
    /// Bound on a single group wait.
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,
    /// Pause after a timed-out poll.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Number of polls before giving up.
    pub max_polls: u32,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A participant drained between polls.
#[derive(Clone)]
pub struct StreamCollector {
    name: String,
    source: Arc<dyn Collectable>,
}

impl std::fmt::Debug for StreamCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCollector")
            .field("name", &self.name)
            .finish()
    }
}

impl StreamCollector {
    /// Wrap a collectable participant.
    pub fn new(name: impl Into<String>, source: Arc<dyn Collectable>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// Participant name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What the drain loop saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Group that was drained.
    pub group: String,
    /// Poll cycles performed, the final one included.
    pub polls: u32,
    /// Polls that timed out.
    pub timeouts: u32,
    /// Stream records received, per participant.
    pub datums: BTreeMap<String, u64>,
    /// Frames covered by those records, per participant.
    pub frames: BTreeMap<String, u64>,
    /// Polls after which each participant had delivered its first frame.
    pub first_data_poll: BTreeMap<String, u32>,
    /// Capture counters read after completion, per participant.
    pub captured: BTreeMap<String, u64>,
}

impl DrainReport {
    fn new(group: &str, collectors: &[StreamCollector]) -> Self {
        let zeroes = || {
            collectors
                .iter()
                .map(|c| (c.name.clone(), 0))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            group: group.to_string(),
            datums: zeroes(),
            frames: zeroes(),
            ..Default::default()
        }
    }

    /// Frames drained from `participant`.
    pub fn frames_for(&self, participant: &str) -> u64 {
        self.frames.get(participant).copied().unwrap_or(0)
    }

    /// Whether every participant reported the same capture count.
    pub fn counts_agree(&self) -> bool {
        let mut counts = self.captured.values();
        match counts.next() {
            Some(first) => counts.all(|c| c == first),
            None => true,
        }
    }

    /// Log the capture counts. A mismatch is a warning only, since
    /// pipelines may finish at slightly different times.
    pub fn log_capture_counts(&self) {
        if self.counts_agree() {
            info!(group = %self.group, captured = ?self.captured, "Capture counts agree");
        } else {
            warn!(group = %self.group, captured = ?self.captured, "Capture counts differ between participants");
        }
    }
}

async fn drain_once(collectors: &[StreamCollector], report: &mut DrainReport) -> FlyscanResult<()> {
    for collector in collectors {
        let data = collector
            .source
            .collect()
            .await
            .map_err(|e| FlyscanError::participant(&collector.name, Phase::Collect, e))?;
        if data.is_empty() {
            continue;
        }
        let frames: u64 = data.iter().map(|d| d.len()).sum();
        *report.datums.entry(collector.name.clone()).or_default() += data.len() as u64;
        *report.frames.entry(collector.name.clone()).or_default() += frames;
        report
            .first_data_poll
            .entry(collector.name.clone())
            .or_insert(report.polls);
        debug!(
            participant = %collector.name,
            records = data.len(),
            frames,
            "Drained stream data"
        );
    }
    Ok(())
}

/// Poll `group` until every member finished, draining `collectors` after
/// every poll.
///
/// - A poll that times out is normal: collectors are drained, the loop
///   pauses for `poll_interval` and polls again.
/// - The loop ends only on a poll that returns without timing out, after a
///   last drain.
/// - A failing member ends the loop after a last drain.
/// - More than `max_polls` polls is a [`FlyscanError::HardwareTimeout`].
/// - An abort is observed at every poll boundary and during waits.
pub async fn drain_until_complete(
    group: &mut CompletionGroup,
    settings: &DrainSettings,
    collectors: &[StreamCollector],
    abort: &AbortSignal,
) -> FlyscanResult<DrainReport> {
    let mut report = DrainReport::new(group.name(), collectors);
    let phase = group.phase();

    loop {
        abort.check()?;
        report.polls += 1;

        let status = tokio::select! {
            status = group.wait(settings.poll_timeout) => status,
            reason = abort.aborted() => return Err(FlyscanError::Aborted(reason)),
        };

        drain_once(collectors, &mut report).await?;

        match status {
            WaitStatus::Complete => break,
            WaitStatus::Failed { member, error } => {
                return Err(FlyscanError::participant(member, phase, error));
            }
            WaitStatus::TimedOut { pending } => {
                report.timeouts += 1;
                if report.polls >= settings.max_polls {
                    return Err(FlyscanError::HardwareTimeout {
                        group: group.name().to_string(),
                        polls: report.polls,
                        pending,
                    });
                }
                debug!(
                    group = %group.name(),
                    poll = report.polls,
                    ?pending,
                    "Completion wait timed out, polling again"
                );
            }
        }

        tokio::select! {
            _ = sleep(settings.poll_interval) => {}
            reason = abort.aborted() => return Err(FlyscanError::Aborted(reason)),
        }
    }

    for collector in collectors {
        let captured = collector
            .source
            .captured_count()
            .await
            .map_err(|e| FlyscanError::participant(&collector.name, Phase::Collect, e))?;
        report.captured.insert(collector.name.clone(), captured);
    }
    if !collectors.is_empty() {
        report.log_capture_counts();
    }

    info!(
        group = %report.group,
        polls = report.polls,
        frames = ?report.frames,
        "Completion group done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::abort_channel;
    use async_trait::async_trait;
    use flyscan_core::data::StreamDatum;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Collector that reports whatever its acquisition published.
    #[derive(Default)]
    struct FrameCounter {
        written: AtomicU64,
        collected: AtomicU64,
    }

    #[async_trait]
    impl Collectable for FrameCounter {
        async fn collect(&self) -> anyhow::Result<Vec<StreamDatum>> {
            let written = self.written.load(Ordering::SeqCst);
            let collected = self.collected.swap(written, Ordering::SeqCst);
            if written == collected {
                return Ok(Vec::new());
            }
            Ok(vec![StreamDatum::new("counter_stream", collected..written)])
        }

        async fn captured_count(&self) -> anyhow::Result<u64> {
            Ok(self.written.load(Ordering::SeqCst))
        }
    }

    fn finishing_after(
        counter: &Arc<FrameCounter>,
        millis: u64,
        frames: u64,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        let counter = counter.clone();
        async move {
            sleep(Duration::from_millis(millis)).await;
            counter.written.store(frames, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(max_polls: u32) -> DrainSettings {
        DrainSettings {
            poll_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            max_polls,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_members_drain_between_polls() {
        let fast = Arc::new(FrameCounter::default());
        let slow = Arc::new(FrameCounter::default());
        let mut group = CompletionGroup::new("complete");
        group.add("fast", finishing_after(&fast, 300, 10));
        group.add("slow", finishing_after(&slow, 700, 10));

        let collectors = [
            StreamCollector::new("fast", fast.clone()),
            StreamCollector::new("slow", slow.clone()),
        ];
        let start = Instant::now();
        let report =
            drain_until_complete(&mut group, &settings(10), &collectors, &AbortSignal::never())
                .await
                .unwrap();

        assert_eq!(report.polls, 2);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.first_data_poll["fast"], 1);
        assert_eq!(report.first_data_poll["slow"], 2);
        assert_eq!(report.frames_for("fast"), 10);
        assert_eq!(report.frames_for("slow"), 10);
        assert!(report.counts_agree());

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_000), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_polls_raises_hardware_timeout() {
        let mut group = CompletionGroup::new("complete");
        group.add("stuck", std::future::pending());

        let err = drain_until_complete(&mut group, &settings(3), &[], &AbortSignal::never())
            .await
            .unwrap_err();
        match err {
            FlyscanError::HardwareTimeout { group, polls, pending } => {
                assert_eq!(group, "complete");
                assert_eq!(polls, 3);
                assert_eq!(pending, vec!["stuck".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_member_drained_then_reported() {
        let counter = Arc::new(FrameCounter::default());
        counter.written.store(4, Ordering::SeqCst);
        let mut group = CompletionGroup::new("prepare").with_phase(Phase::Prepare);
        group.add("camera", async { Err::<(), _>(anyhow::anyhow!("trigger fault")) });

        let collectors = [StreamCollector::new("camera", counter.clone())];
        let err = drain_until_complete(&mut group, &settings(10), &collectors, &AbortSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FlyscanError::Participant { ref participant, phase: Phase::Prepare, .. } if participant == "camera"
        ));
        // The final drain happened before the error surfaced.
        assert_eq!(counter.collected.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_wait() {
        let (handle, signal) = abort_channel();
        let mut group = CompletionGroup::new("complete");
        group.add("stuck", std::future::pending());

        tokio::spawn(async move {
            sleep(Duration::from_millis(1_200)).await;
            handle.abort("operator interrupt");
        });

        let err = drain_until_complete(&mut group, &settings(100), &[], &signal)
            .await
            .unwrap_err();
        assert!(err.is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_harvests_finished_members_on_timeout() {
        let mut group = CompletionGroup::new("complete");
        group.add("quick", async { anyhow::Ok(()) });
        group.add("stuck", std::future::pending());

        match group.wait(Duration::from_millis(50)).await {
            WaitStatus::TimedOut { pending } => assert_eq!(pending, vec!["stuck".to_string()]),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(!group.is_complete());
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_drain_settings_defaults() {
        let settings = DrainSettings::default();
        assert_eq!(settings.poll_timeout, Duration::from_millis(500));
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
    }
}
