//! Port traits: everything the engine needs from the outside world.
//!
//! Infrastructure crates implement these; the engine only ever sees
//! `Arc<dyn Trait>`. Tests supply in-memory fakes.

use async_trait::async_trait;

use crate::{
    FetchError, PipelineTarget, ProjectId, ReleaseInfo, RunId, StoreError, Timestamp,
    TriggerError, Watermark,
};

/// Persists the per-project watermark across invocations.
///
/// ## Contract
///
/// - `read` returns [`Watermark::Never`] when no state exists.
/// - `write` replaces the stored value atomically: a concurrent reader sees
///   either the old or the new value, never a partial one.
/// - `write` rejects a value older than the one already stored with
///   [`StoreError::Regression`].
/// - `lock` grants at most one holder per project at a time and fails with
///   [`StoreError::Locked`] while another run holds it.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns the last recorded check time for `project`.
    async fn read(&self, project: &ProjectId) -> Result<Watermark, StoreError>;

    /// Records `checked_at` as the new watermark for `project`.
    async fn write(
        &self,
        project: &ProjectId,
        checked_at: Timestamp,
        run: RunId,
    ) -> Result<(), StoreError>;

    /// Unconditionally replaces the watermark. Operator override only; the
    /// engine never calls this.
    async fn reset(
        &self,
        project: &ProjectId,
        watermark: Watermark,
        run: RunId,
    ) -> Result<(), StoreError>;

    /// Acquires the run lock for `project` on behalf of `run`.
    async fn lock(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError>;

    /// Releases a lock previously acquired by `run`. Releasing a lock that
    /// `run` does not hold is a no-op.
    async fn unlock(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError>;
}

/// Queries the release registry for a project's latest release.
///
/// Implementations perform no retries and must bound the call with a timeout,
/// reporting expiry as [`FetchError::Transient`].
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    /// Returns what the registry reports as the latest release of `project`.
    async fn fetch_latest(&self, project: &ProjectId) -> Result<ReleaseInfo, FetchError>;
}

/// Starts the downstream build pipeline.
///
/// Fire-and-forget: success means the pipeline was accepted, not that it
/// finished. Implementations must bound the call with a timeout.
#[async_trait]
pub trait BuildTrigger: Send + Sync {
    /// Requests one run of `target` for `release`.
    async fn trigger(
        &self,
        target: &PipelineTarget,
        release: &ReleaseInfo,
    ) -> Result<(), TriggerError>;
}

/// Source of "now" for capturing a run's start time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// [`Clock`] backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
