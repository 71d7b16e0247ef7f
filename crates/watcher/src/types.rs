//! Shared value types for the release watcher domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (a [`Watermark`] only ever moves forward,
//! a [`ReleaseInfo`] always pairs a tag with its publish instant) and
//! participate in the dispatch decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GitRef, InputName, ReleaseTag, RepositoryId, WorkflowId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parses an RFC 3339 string (e.g. `"2024-01-02T00:00:00Z"`), normalising
    /// any offset to UTC.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// The instant up to which releases have been checked.
///
/// [`Watermark::Never`] is the sentinel for a project that has never completed
/// a run; it orders before every [`Watermark::CheckedAt`] value, so any
/// published release is newer than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "at")]
pub enum Watermark {
    /// No run has ever completed for this project.
    Never,
    /// The last successful run checked releases up to this instant.
    CheckedAt(Timestamp),
}

impl Watermark {
    /// Returns the recorded instant, or `None` for [`Watermark::Never`].
    pub fn timestamp(self) -> Option<Timestamp> {
        match self {
            Watermark::Never => None,
            Watermark::CheckedAt(ts) => Some(ts),
        }
    }

    /// Returns `true` if `instant` is strictly after this watermark.
    pub fn is_before(self, instant: Timestamp) -> bool {
        self < Watermark::CheckedAt(instant)
    }
}

impl From<Option<Timestamp>> for Watermark {
    fn from(value: Option<Timestamp>) -> Self {
        value.map_or(Watermark::Never, Watermark::CheckedAt)
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Watermark::Never => write!(f, "never"),
            Watermark::CheckedAt(ts) => write!(f, "{ts}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Release metadata
// ---------------------------------------------------------------------------

/// The registry's latest release for a project, fetched fresh each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Opaque identifying tag.
    pub tag: ReleaseTag,
    /// Instant the registry reports the release as published.
    pub published_at: Timestamp,
}

impl ReleaseInfo {
    /// Returns `true` if this release was published strictly after `watermark`.
    ///
    /// A release published exactly at the watermark is not new.
    pub fn is_newer_than(&self, watermark: Watermark) -> bool {
        watermark.is_before(self.published_at)
    }
}

// ---------------------------------------------------------------------------
// Watermark policy
// ---------------------------------------------------------------------------

/// How the engine computes the watermark written at the end of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPolicy {
    /// The run's start time, captured before the fetch.
    ///
    /// Can mask a release published between the fetch and a delayed
    /// boundary, because the next run only looks past this run's start.
    #[default]
    RunStart,

    /// The publish time of the latest observed release.
    ///
    /// Immune to the fetch-to-write window, but never advances while the
    /// registry has no releases.
    ReleasePublished,
}

impl WatermarkPolicy {
    /// Computes the watermark to persist after a successful run.
    ///
    /// The result is never older than `previous` nor than the publish time of
    /// the observed release, so a release stamped after the run start (clock
    /// skew, or published while the run was in flight) is not seen as new
    /// again by the next run.
    pub fn next_watermark(
        self,
        previous: Watermark,
        run_start: Timestamp,
        release: Option<&ReleaseInfo>,
    ) -> Watermark {
        let candidate = match self {
            WatermarkPolicy::RunStart => Watermark::CheckedAt(run_start),
            WatermarkPolicy::ReleasePublished => match release {
                Some(r) => Watermark::CheckedAt(r.published_at),
                None => previous,
            },
        };
        let observed = release.map_or(Watermark::Never, |r| Watermark::CheckedAt(r.published_at));
        candidate.max(observed).max(previous)
    }
}

impl std::str::FromStr for WatermarkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run-start" => Ok(WatermarkPolicy::RunStart),
            "release-published" => Ok(WatermarkPolicy::ReleasePublished),
            other => Err(format!(
                "unknown watermark policy '{other}' (expected 'run-start' or 'release-published')"
            )),
        }
    }
}

impl std::fmt::Display for WatermarkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkPolicy::RunStart => write!(f, "run-start"),
            WatermarkPolicy::ReleasePublished => write!(f, "release-published"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch target
// ---------------------------------------------------------------------------

/// The downstream pipeline started when a new release is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTarget {
    /// Repository hosting the workflow.
    pub repository: RepositoryId,
    /// Workflow file name or numeric id.
    pub workflow: WorkflowId,
    /// Ref the workflow runs on.
    pub git_ref: GitRef,
    /// Workflow input that receives the release tag.
    pub tag_input: InputName,
}

impl std::fmt::Display for PipelineTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.repository, self.workflow, self.git_ref)
    }
}
