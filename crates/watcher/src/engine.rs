//! The dispatch decision engine.
//!
//! One [`DispatchEngine::run`] call is one scheduled (or manual) check:
//!
//! 1. capture the run start time,
//! 2. take the project's run lock,
//! 3. read the watermark,
//! 4. fetch the latest release,
//! 5. trigger the downstream pipeline if the release is strictly newer than
//!    the watermark,
//! 6. advance the watermark and release the lock.
//!
//! Any failure before step 6 leaves the watermark untouched, so the next
//! scheduled run re-evaluates from the same baseline. Nothing is retried
//! inside a run.

use std::sync::Arc;

use tracing::{debug, error, info, warn, Instrument};

use crate::ports::{BuildTrigger, Clock, ReleaseFetcher, SystemClock, WatermarkStore};
use crate::{
    FetchError, PipelineTarget, ProjectId, ReleaseInfo, ReleaseTag, RetryPolicy, RunId,
    StoreError, Timestamp, TriggerError, Watermark, WatermarkPolicy,
};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a run failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The registry query failed (transient, malformed, or unknown project).
    Fetch(FetchError),
    /// The downstream dispatch call failed.
    Trigger(TriggerError),
    /// The watermark store could not be read or written.
    Persistence(StoreError),
    /// Another run holds the project's run lock.
    ConcurrentRun {
        /// Description of the lock holder.
        holder: String,
    },
}

impl FailureReason {
    /// Stable label used in log fields and JSON output.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Fetch(FetchError::Transient { .. }) => "transient_error",
            FailureReason::Fetch(FetchError::MalformedResponse { .. }) => "malformed_response",
            FailureReason::Fetch(FetchError::ProjectNotFound { .. }) => "project_not_found",
            FailureReason::Fetch(FetchError::NotFound { .. }) => "not_found",
            FailureReason::Trigger(_) => "trigger_failure",
            FailureReason::Persistence(_) => "persistence_failure",
            FailureReason::ConcurrentRun { .. } => "concurrent_run",
        }
    }

    /// Persistence failures mean no outcome could be safely recorded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureReason::Persistence(_))
    }

    /// Returns the recovery expectation for this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            FailureReason::Fetch(e) => e.retry_policy(),
            FailureReason::Trigger(e) => e.retry_policy(),
            FailureReason::Persistence(e) => e.retry_policy(),
            FailureReason::ConcurrentRun { .. } => RetryPolicy::Retryable { after: None },
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Fetch(e) => write!(f, "{e}"),
            FailureReason::Trigger(e) => write!(f, "{e}"),
            FailureReason::Persistence(e) => write!(f, "{e}"),
            FailureReason::ConcurrentRun { holder } => {
                write!(f, "another run is in progress ({holder})")
            }
        }
    }
}

/// Result of one engine run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A new release was found and the downstream pipeline was started (or,
    /// in a dry run, would have been).
    Triggered(ReleaseTag),
    /// Nothing newer than the watermark.
    NoOp,
    /// The run failed; see the reason.
    Failed(FailureReason),
}

impl RunOutcome {
    /// Stable label used in log fields and JSON output.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Triggered(_) => "triggered",
            RunOutcome::NoOp => "no_op",
            RunOutcome::Failed(_) => "failed",
        }
    }

    /// Process exit code: `0` for success, `1` for a failed run, `2` for a
    /// fatal (persistence) failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Triggered(_) | RunOutcome::NoOp => 0,
            RunOutcome::Failed(reason) if reason.is_fatal() => 2,
            RunOutcome::Failed(_) => 1,
        }
    }
}

/// Whether a run acts on its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Trigger on a new release and advance the watermark.
    Dispatch,
    /// Decide only: no lock, no trigger, no write.
    DryRun,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Dispatch => write!(f, "dispatch"),
            RunMode::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Everything observed during one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier of this run.
    pub run_id: RunId,
    /// Project that was checked.
    pub project: ProjectId,
    /// Whether the run acted on its decision.
    pub mode: RunMode,
    /// Instant captured before anything else happened.
    pub run_start: Timestamp,
    /// Watermark read at the start of the run; `None` if it was never read.
    pub previous: Option<Watermark>,
    /// Latest release reported by the registry, if any was fetched.
    pub release: Option<ReleaseInfo>,
    /// Watermark persisted by this run (or that a dry run would persist).
    pub recorded: Option<Watermark>,
    /// Final outcome.
    pub outcome: RunOutcome,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Static configuration of a watcher.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upstream project being watched.
    pub project: ProjectId,
    /// Pipeline started on a new release.
    pub target: PipelineTarget,
    /// How the watermark advances.
    pub policy: WatermarkPolicy,
}

/// Decides whether a new release has appeared and dispatches the downstream
/// pipeline at most once for it.
pub struct DispatchEngine {
    config: EngineConfig,
    store: Arc<dyn WatermarkStore>,
    fetcher: Arc<dyn ReleaseFetcher>,
    trigger: Arc<dyn BuildTrigger>,
    clock: Arc<dyn Clock>,
}

impl DispatchEngine {
    /// Creates an engine using the system clock.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn WatermarkStore>,
        fetcher: Arc<dyn ReleaseFetcher>,
        trigger: Arc<dyn BuildTrigger>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            trigger,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used to capture run start times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Executes one run.
    ///
    /// Never returns an error: every failure is reported as
    /// [`RunOutcome::Failed`] in the returned report.
    pub async fn run(&self, mode: RunMode) -> RunReport {
        let run_id = RunId::new_random();
        let span = tracing::info_span!(
            "watch_run",
            %run_id,
            project = %self.config.project,
            %mode,
        );
        self.execute(run_id, mode).instrument(span).await
    }

    async fn execute(&self, run_id: RunId, mode: RunMode) -> RunReport {
        let project = &self.config.project;
        let mut report = RunReport {
            run_id,
            project: project.clone(),
            mode,
            run_start: self.clock.now(),
            previous: None,
            release: None,
            recorded: None,
            outcome: RunOutcome::NoOp,
        };

        if mode == RunMode::Dispatch {
            match self.store.lock(project, run_id).await {
                Ok(()) => {}
                Err(StoreError::Locked { holder, .. }) => {
                    report.outcome = RunOutcome::Failed(FailureReason::ConcurrentRun { holder });
                    log_outcome(&report);
                    return report;
                }
                Err(e) => {
                    report.outcome = RunOutcome::Failed(FailureReason::Persistence(e));
                    log_outcome(&report);
                    return report;
                }
            }
        }

        let outcome = self.decide_and_act(&mut report).await;
        report.outcome = outcome;

        if mode == RunMode::Dispatch {
            if let Err(e) = self.store.unlock(project, run_id).await {
                // The lock expires after its TTL; the outcome stands.
                warn!(error = %e, "failed to release run lock");
            }
        }

        log_outcome(&report);
        report
    }

    async fn decide_and_act(&self, report: &mut RunReport) -> RunOutcome {
        let project = &self.config.project;
        let dispatch = report.mode == RunMode::Dispatch;

        let watermark = match self.store.read(project).await {
            Ok(w) => w,
            Err(e) => return RunOutcome::Failed(FailureReason::Persistence(e)),
        };
        report.previous = Some(watermark);

        let release = match self.fetcher.fetch_latest(project).await {
            Ok(release) => Some(release),
            Err(FetchError::NotFound { .. }) => {
                info!("project has no published releases");
                None
            }
            Err(e) => return RunOutcome::Failed(FailureReason::Fetch(e)),
        };
        report.release = release.clone();

        let fresh = release.as_ref().filter(|r| r.is_newer_than(watermark));
        match fresh {
            Some(r) => {
                info!(
                    tag = %r.tag,
                    published_at = %r.published_at,
                    %watermark,
                    "release is newer than watermark"
                );
                if dispatch {
                    if let Err(e) = self.trigger.trigger(&self.config.target, r).await {
                        return RunOutcome::Failed(FailureReason::Trigger(e));
                    }
                    info!(pipeline = %self.config.target, tag = %r.tag, "downstream pipeline triggered");
                }
            }
            None => debug!(%watermark, "no release newer than watermark"),
        }

        let next = self
            .config
            .policy
            .next_watermark(watermark, report.run_start, release.as_ref());

        if let Some(checked_at) = next.timestamp() {
            report.recorded = Some(next);
            if dispatch {
                match self.store.write(project, checked_at, report.run_id).await {
                    Ok(()) => {}
                    Err(StoreError::Regression { stored, attempted }) => {
                        warn!(%stored, %attempted, "a fresher watermark is already recorded");
                        report.recorded = Some(stored);
                    }
                    Err(e) => {
                        if let Some(r) = fresh {
                            error!(
                                tag = %r.tag,
                                "pipeline was triggered but the watermark was not advanced; \
                                 the next run will trigger it again"
                            );
                        }
                        return RunOutcome::Failed(FailureReason::Persistence(e));
                    }
                }
            }
        }

        match fresh {
            Some(r) => RunOutcome::Triggered(r.tag.clone()),
            None => RunOutcome::NoOp,
        }
    }
}

/// Emits the single `run.outcome` event for a finished run.
///
/// Carries `project` and `run_id` itself so consumers reading events without
/// span context still see them.
fn log_outcome(report: &RunReport) {
    let project = &report.project;
    let run_id = report.run_id;
    let outcome = report.outcome.label();
    let reason = match &report.outcome {
        RunOutcome::Triggered(tag) => {
            info!(event = "run.outcome", %project, %run_id, outcome, tag = tag.as_str(), "run finished");
            return;
        }
        RunOutcome::NoOp => {
            info!(event = "run.outcome", %project, %run_id, outcome, "run finished");
            return;
        }
        RunOutcome::Failed(reason) => reason,
    };

    let policy = reason.retry_policy();
    let retryable = policy.is_retryable();
    let retry_after_secs = policy.after().map(|d| d.as_secs());
    let label = reason.label();
    let quiet = retryable
        && !matches!(
            reason,
            FailureReason::Fetch(FetchError::MalformedResponse { .. })
        );

    if reason.is_fatal() {
        error!(
            event = "run.outcome",
            %project,
            %run_id,
            outcome,
            reason = label,
            retryable,
            retry_after_secs,
            error = %reason,
            "run failed; watermark could not be recorded"
        );
    } else if quiet {
        warn!(
            event = "run.outcome",
            %project,
            %run_id,
            outcome,
            reason = label,
            retryable,
            retry_after_secs,
            error = %reason,
            "run failed; watermark unchanged"
        );
    } else {
        error!(
            event = "run.outcome",
            %project,
            %run_id,
            outcome,
            reason = label,
            retryable,
            retry_after_secs,
            error = %reason,
            "run failed; watermark unchanged"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::{GitRef, InputName, RepositoryId, WorkflowId};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct MemoryStore {
        watermark: Mutex<Option<Timestamp>>,
        writes: Mutex<Vec<Timestamp>>,
        holder: Mutex<Option<RunId>>,
        fail_reads: Mutex<bool>,
        fail_writes: Mutex<bool>,
    }

    impl MemoryStore {
        fn at(ts: Timestamp) -> Self {
            let store = Self::default();
            *store.watermark.lock().unwrap() = Some(ts);
            store
        }

        fn current(&self) -> Watermark {
            (*self.watermark.lock().unwrap()).into()
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WatermarkStore for MemoryStore {
        async fn read(&self, _project: &ProjectId) -> Result<Watermark, StoreError> {
            if *self.fail_reads.lock().unwrap() {
                return Err(StoreError::Unavailable {
                    message: "disk gone".into(),
                });
            }
            Ok(self.current())
        }

        async fn write(
            &self,
            _project: &ProjectId,
            checked_at: Timestamp,
            _run: RunId,
        ) -> Result<(), StoreError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(StoreError::Unavailable {
                    message: "read-only filesystem".into(),
                });
            }
            let mut current = self.watermark.lock().unwrap();
            if let Some(stored) = *current {
                if stored > checked_at {
                    return Err(StoreError::Regression {
                        stored: Watermark::CheckedAt(stored),
                        attempted: Watermark::CheckedAt(checked_at),
                    });
                }
            }
            *current = Some(checked_at);
            self.writes.lock().unwrap().push(checked_at);
            Ok(())
        }

        async fn reset(
            &self,
            _project: &ProjectId,
            watermark: Watermark,
            _run: RunId,
        ) -> Result<(), StoreError> {
            *self.watermark.lock().unwrap() = watermark.timestamp();
            Ok(())
        }

        async fn lock(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError> {
            let mut holder = self.holder.lock().unwrap();
            match *holder {
                Some(other) => Err(StoreError::Locked {
                    project: project.clone(),
                    holder: other.to_string(),
                }),
                None => {
                    *holder = Some(run);
                    Ok(())
                }
            }
        }

        async fn unlock(&self, _project: &ProjectId, run: RunId) -> Result<(), StoreError> {
            let mut holder = self.holder.lock().unwrap();
            if *holder == Some(run) {
                *holder = None;
            }
            Ok(())
        }
    }

    struct FakeFetcher {
        response: Mutex<Result<ReleaseInfo, FetchError>>,
        calls: Mutex<usize>,
    }

    impl FakeFetcher {
        fn returning(response: Result<ReleaseInfo, FetchError>) -> Self {
            Self {
                response: Mutex::new(response),
                calls: Mutex::new(0),
            }
        }

        fn set(&self, response: Result<ReleaseInfo, FetchError>) {
            *self.response.lock().unwrap() = response;
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ReleaseFetcher for FakeFetcher {
        async fn fetch_latest(&self, _project: &ProjectId) -> Result<ReleaseInfo, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.response.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct RecordingTrigger {
        calls: Mutex<Vec<ReleaseTag>>,
        failure: Mutex<Option<TriggerError>>,
    }

    impl RecordingTrigger {
        fn tags(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.to_string())
                .collect()
        }

        fn fail_with(&self, err: Option<TriggerError>) {
            *self.failure.lock().unwrap() = err;
        }
    }

    #[async_trait]
    impl BuildTrigger for RecordingTrigger {
        async fn trigger(
            &self,
            _target: &PipelineTarget,
            release: &ReleaseInfo,
        ) -> Result<(), TriggerError> {
            if let Some(err) = self.failure.lock().unwrap().clone() {
                return Err(err);
            }
            self.calls.lock().unwrap().push(release.tag.clone());
            Ok(())
        }
    }

    struct FixedClock(Mutex<Timestamp>);

    impl FixedClock {
        fn at(s: &str) -> Self {
            Self(Mutex::new(ts(s)))
        }

        fn set(&self, s: &str) {
            *self.0.lock().unwrap() = ts(s);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            *self.0.lock().unwrap()
        }
    }

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse_rfc3339(s).unwrap()
    }

    fn release(tag: &str, at: &str) -> ReleaseInfo {
        ReleaseInfo {
            tag: ReleaseTag::new(tag).unwrap(),
            published_at: ts(at),
        }
    }

    fn project() -> ProjectId {
        ProjectId::parse("upstream/tool").unwrap()
    }

    fn config(policy: WatermarkPolicy) -> EngineConfig {
        EngineConfig {
            project: project(),
            target: PipelineTarget {
                repository: RepositoryId::parse("packaging/builds").unwrap(),
                workflow: WorkflowId::new("build.yml").unwrap(),
                git_ref: GitRef::new("main").unwrap(),
                tag_input: InputName::new("release_tag").unwrap(),
            },
            policy,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        fetcher: Arc<FakeFetcher>,
        trigger: Arc<RecordingTrigger>,
        clock: Arc<FixedClock>,
        engine: DispatchEngine,
    }

    fn harness(
        store: MemoryStore,
        response: Result<ReleaseInfo, FetchError>,
        now: &str,
        policy: WatermarkPolicy,
    ) -> Harness {
        let store = Arc::new(store);
        let fetcher = Arc::new(FakeFetcher::returning(response));
        let trigger = Arc::new(RecordingTrigger::default());
        let clock = Arc::new(FixedClock::at(now));
        let engine = DispatchEngine::new(
            config(policy),
            store.clone(),
            fetcher.clone(),
            trigger.clone(),
        )
        .with_clock(clock.clone());
        Harness {
            store,
            fetcher,
            trigger,
            clock,
            engine,
        }
    }

    fn transient() -> FetchError {
        FetchError::Transient {
            message: "connection reset".into(),
            retry_after: None,
        }
    }

    // -----------------------------------------------------------------------
    // Reference scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn newer_release_triggers_and_advances_to_run_start() {
        let h = harness(
            MemoryStore::at(ts("2024-01-01T00:00:00Z")),
            Ok(release("v2.2.0", "2024-01-02T00:00:00Z")),
            "2024-01-02T06:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v2.2.0").unwrap())
        );
        assert_eq!(h.trigger.tags(), vec!["v2.2.0"]);
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-01-02T06:00:00Z"))
        );
        assert_eq!(report.outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn older_release_is_a_no_op_but_advances_watermark() {
        let h = harness(
            MemoryStore::at(ts("2024-01-05T00:00:00Z")),
            Ok(release("v2.1.3", "2024-01-02T00:00:00Z")),
            "2024-01-06T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome, RunOutcome::NoOp);
        assert!(h.trigger.tags().is_empty());
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-01-06T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn transient_fetch_failure_leaves_watermark_unchanged() {
        let h = harness(
            MemoryStore::at(ts("2024-01-01T00:00:00Z")),
            Err(transient()),
            "2024-01-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Failed(FailureReason::Fetch(transient()))
        );
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-01-01T00:00:00Z"))
        );
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(report.outcome.exit_code(), 1);
    }

    // -----------------------------------------------------------------------
    // Properties across runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn repeated_runs_against_an_old_release_stay_no_op() {
        let h = harness(
            MemoryStore::at(ts("2024-02-01T00:00:00Z")),
            Ok(release("v1.0.0", "2024-02-01T00:00:00Z")),
            "2024-02-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        for _ in 0..5 {
            let report = h.engine.run(RunMode::Dispatch).await;
            assert_eq!(report.outcome, RunOutcome::NoOp);
        }
        assert!(h.trigger.tags().is_empty());
    }

    #[tokio::test]
    async fn one_release_triggers_exactly_once_across_runs() {
        let h = harness(
            MemoryStore::at(ts("2024-03-01T00:00:00Z")),
            Ok(release("v3.0.0", "2024-03-01T12:00:00Z")),
            "2024-03-01T13:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let mut triggered = 0;
        for hour in 13..20 {
            h.clock.set(&format!("2024-03-01T{hour}:00:00Z"));
            if let RunOutcome::Triggered(_) = h.engine.run(RunMode::Dispatch).await.outcome {
                triggered += 1;
            }
        }

        assert_eq!(triggered, 1);
        assert_eq!(h.trigger.tags(), vec!["v3.0.0"]);
    }

    #[tokio::test]
    async fn release_stamped_after_run_start_triggers_once() {
        let h = harness(
            MemoryStore::at(ts("2024-01-01T00:00:00Z")),
            Ok(release("v2.2.0", "2024-01-02T00:00:05Z")),
            "2024-01-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let first = h.engine.run(RunMode::Dispatch).await;
        assert_eq!(
            first.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v2.2.0").unwrap())
        );
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-01-02T00:00:05Z"))
        );

        h.clock.set("2024-01-02T01:00:00Z");
        let second = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(second.outcome, RunOutcome::NoOp);
        assert_eq!(h.trigger.tags(), vec!["v2.2.0"]);
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-01-02T01:00:00Z"))
        );
    }

    #[tokio::test]
    async fn release_is_detected_after_a_transient_failure() {
        let h = harness(
            MemoryStore::at(ts("2024-04-01T00:00:00Z")),
            Err(transient()),
            "2024-04-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let first = h.engine.run(RunMode::Dispatch).await;
        assert!(matches!(first.outcome, RunOutcome::Failed(_)));

        h.fetcher.set(Ok(release("v4.0.0", "2024-04-01T12:00:00Z")));
        h.clock.set("2024-04-03T00:00:00Z");
        let second = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(
            second.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v4.0.0").unwrap())
        );
    }

    #[tokio::test]
    async fn trigger_failure_keeps_release_new_for_next_run() {
        let h = harness(
            MemoryStore::at(ts("2024-05-01T00:00:00Z")),
            Ok(release("v5.0.0", "2024-05-01T08:00:00Z")),
            "2024-05-01T09:00:00Z",
            WatermarkPolicy::RunStart,
        );
        h.trigger.fail_with(Some(TriggerError::Transient {
            message: "502 Bad Gateway".into(),
            retry_after: None,
        }));

        let first = h.engine.run(RunMode::Dispatch).await;
        assert_eq!(first.outcome.label(), "failed");
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(first.recorded, None);

        h.trigger.fail_with(None);
        h.clock.set("2024-05-01T10:00:00Z");
        let second = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(
            second.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v5.0.0").unwrap())
        );
        assert_eq!(h.trigger.tags(), vec!["v5.0.0"]);
    }

    #[tokio::test]
    async fn watermark_never_decreases_over_a_run_sequence() {
        let h = harness(
            MemoryStore::default(),
            Ok(release("v1", "2024-06-01T00:00:00Z")),
            "2024-06-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        // The clock jumps backwards on the third run.
        let clocks = [
            "2024-06-02T00:00:00Z",
            "2024-06-03T00:00:00Z",
            "2024-06-02T12:00:00Z",
            "2024-06-04T00:00:00Z",
        ];
        let mut last = Watermark::Never;
        for now in clocks {
            h.clock.set(now);
            h.engine.run(RunMode::Dispatch).await;
            let current = h.store.current();
            assert!(current >= last, "{current} < {last}");
            last = current;
        }
        assert_eq!(last, Watermark::CheckedAt(ts("2024-06-04T00:00:00Z")));
    }

    #[tokio::test]
    async fn first_run_treats_any_release_as_new() {
        let h = harness(
            MemoryStore::default(),
            Ok(release("v0.1.0", "2020-01-01T00:00:00Z")),
            "2024-07-01T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.previous, Some(Watermark::Never));
        assert_eq!(
            report.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v0.1.0").unwrap())
        );
    }

    // -----------------------------------------------------------------------
    // Registry edge cases
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn project_without_releases_is_a_no_op() {
        let h = harness(
            MemoryStore::at(ts("2024-08-01T00:00:00Z")),
            Err(FetchError::NotFound { project: project() }),
            "2024-08-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome, RunOutcome::NoOp);
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-08-02T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn unknown_project_is_a_failure_not_a_no_op() {
        let h = harness(
            MemoryStore::at(ts("2024-08-01T00:00:00Z")),
            Err(FetchError::ProjectNotFound { project: project() }),
            "2024-08-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        match &report.outcome {
            RunOutcome::Failed(reason) => {
                assert_eq!(reason.label(), "project_not_found");
                assert_eq!(reason.retry_policy(), RetryPolicy::NonRetryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn malformed_response_is_reported_distinctly() {
        let h = harness(
            MemoryStore::at(ts("2024-08-01T00:00:00Z")),
            Err(FetchError::MalformedResponse {
                message: "published_at missing".into(),
            }),
            "2024-08-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        match &report.outcome {
            RunOutcome::Failed(reason) => assert_eq!(reason.label(), "malformed_response"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(h.store.write_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Persistence and concurrency
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unreadable_store_is_fatal() {
        let store = MemoryStore::default();
        *store.fail_reads.lock().unwrap() = true;
        let h = harness(
            store,
            Ok(release("v1", "2024-09-01T00:00:00Z")),
            "2024-09-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome.exit_code(), 2);
        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.trigger.tags().is_empty());
    }

    #[tokio::test]
    async fn failed_write_after_trigger_surfaces_as_persistence_failure() {
        let store = MemoryStore::at(ts("2024-09-01T00:00:00Z"));
        *store.fail_writes.lock().unwrap() = true;
        let h = harness(
            store,
            Ok(release("v9", "2024-09-01T06:00:00Z")),
            "2024-09-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        match &report.outcome {
            RunOutcome::Failed(reason) => assert!(reason.is_fatal()),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(h.trigger.tags(), vec!["v9"]);
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-09-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn overlapping_run_is_rejected_before_fetching() {
        let h = harness(
            MemoryStore::at(ts("2024-10-01T00:00:00Z")),
            Ok(release("v10", "2024-10-01T06:00:00Z")),
            "2024-10-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );
        let other_run = RunId::new_random();
        h.store.lock(&project(), other_run).await.unwrap();

        let report = h.engine.run(RunMode::Dispatch).await;

        match &report.outcome {
            RunOutcome::Failed(FailureReason::ConcurrentRun { holder }) => {
                assert_eq!(holder, &other_run.to_string());
            }
            other => panic!("expected concurrent run failure, got {other:?}"),
        }
        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.trigger.tags().is_empty());

        // Once the other run finishes, the release is still new.
        h.store.unlock(&project(), other_run).await.unwrap();
        let report = h.engine.run(RunMode::Dispatch).await;
        assert_eq!(report.outcome.label(), "triggered");
    }

    #[tokio::test]
    async fn lock_is_released_after_a_failed_run() {
        let h = harness(
            MemoryStore::at(ts("2024-10-01T00:00:00Z")),
            Err(transient()),
            "2024-10-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        h.engine.run(RunMode::Dispatch).await;

        assert!(h.store.holder.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn fresher_stored_watermark_is_kept() {
        // Stored value is ahead of this run's start (clock skew between hosts).
        let h = harness(
            MemoryStore::at(ts("2024-11-05T00:00:00Z")),
            Ok(release("v11", "2024-11-01T00:00:00Z")),
            "2024-11-04T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome, RunOutcome::NoOp);
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2024-11-05T00:00:00Z"))
        );
    }

    // -----------------------------------------------------------------------
    // Modes and policies
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dry_run_neither_triggers_nor_writes() {
        let h = harness(
            MemoryStore::at(ts("2024-12-01T00:00:00Z")),
            Ok(release("v12", "2024-12-01T06:00:00Z")),
            "2024-12-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::DryRun).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Triggered(ReleaseTag::new("v12").unwrap())
        );
        assert!(h.trigger.tags().is_empty());
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(
            report.recorded,
            Some(Watermark::CheckedAt(ts("2024-12-02T00:00:00Z")))
        );
    }

    #[tokio::test]
    async fn release_published_policy_records_release_time() {
        let h = harness(
            MemoryStore::at(ts("2025-01-01T00:00:00Z")),
            Ok(release("v13", "2025-01-01T06:00:00Z")),
            "2025-01-02T00:00:00Z",
            WatermarkPolicy::ReleasePublished,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome.label(), "triggered");
        assert_eq!(
            h.store.current(),
            Watermark::CheckedAt(ts("2025-01-01T06:00:00Z"))
        );
    }

    #[tokio::test]
    async fn release_published_policy_skips_write_without_releases() {
        let h = harness(
            MemoryStore::default(),
            Err(FetchError::NotFound { project: project() }),
            "2025-01-02T00:00:00Z",
            WatermarkPolicy::ReleasePublished,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        assert_eq!(report.outcome, RunOutcome::NoOp);
        assert_eq!(report.recorded, None);
        assert_eq!(h.store.write_count(), 0);
    }

    #[test]
    fn rate_limited_failure_reports_back_off() {
        let reason = FailureReason::Fetch(FetchError::Transient {
            message: "rate limited".into(),
            retry_after: Some(Duration::from_secs(30)),
        });
        assert_eq!(reason.label(), "transient_error");
        assert!(reason.retry_policy().is_retryable());
        assert_eq!(reason.retry_policy().after(), Some(Duration::from_secs(30)));
        assert_eq!(
            reason.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(RunOutcome::Failed(reason).exit_code(), 1);
    }

    // -----------------------------------------------------------------------
    // Outcome event
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct EventFields(BTreeMap<String, String>);

    impl Visit for EventFields {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<Mutex<Vec<BTreeMap<String, String>>>>);

    impl<S: Subscriber> Layer<S> for CapturedEvents {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = EventFields::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields.0);
        }
    }

    impl CapturedEvents {
        fn outcome_events(&self) -> Vec<BTreeMap<String, String>> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.get("event").map(String::as_str) == Some("run.outcome"))
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn outcome_event_carries_identity_and_back_off() {
        let captured = CapturedEvents::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = harness(
            MemoryStore::at(ts("2025-02-01T00:00:00Z")),
            Err(FetchError::Transient {
                message: "rate limited".into(),
                retry_after: Some(Duration::from_secs(45)),
            }),
            "2025-02-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        let events = captured.outcome_events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event["project"], "upstream/tool");
        assert_eq!(event["run_id"], report.run_id.to_string());
        assert_eq!(event["outcome"], "failed");
        assert_eq!(event["reason"], "transient_error");
        assert_eq!(event["retryable"], "true");
        assert_eq!(event["retry_after_secs"], "45");
    }

    #[tokio::test]
    async fn triggered_outcome_event_names_the_tag() {
        let captured = CapturedEvents::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = harness(
            MemoryStore::default(),
            Ok(release("v9.0.0", "2025-03-01T00:00:00Z")),
            "2025-03-02T00:00:00Z",
            WatermarkPolicy::RunStart,
        );

        let report = h.engine.run(RunMode::Dispatch).await;

        let events = captured.outcome_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["tag"], "v9.0.0");
        assert_eq!(events[0]["run_id"], report.run_id.to_string());
        assert!(!events[0].contains_key("retryable"));
    }
}
