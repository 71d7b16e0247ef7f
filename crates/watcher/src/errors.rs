//! Error and retry-policy types for the release watcher domain.
//!
//! Each port has its own error type ([`FetchError`], [`TriggerError`],
//! [`StoreError`]); infrastructure crates map transport failures onto these
//! variants and the engine folds them into a
//! [`RunOutcome`](crate::engine::RunOutcome). [`WatcherError`] covers conditions
//! that stop the binary before an engine run can start.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in recovery decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ProjectId, Watermark};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is expected to clear by itself and, if so,
/// after what delay.
///
/// The watcher never retries inside a run. The policy is reported in the run
/// outcome so that operators (and the scheduler) can tell a blip from a
/// condition that needs a human.
///
/// - `Retryable`: timeouts, 5xx responses, rate limits, malformed payloads.
/// - `NonRetryable`: missing project, rejected dispatch, unavailable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The next scheduled run can be expected to recover.
    ///
    /// `after` optionally specifies the minimum delay before that is useful
    /// (e.g. derived from `Retry-After` or `x-ratelimit-reset` headers).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means the next
        /// scheduled tick is fine.
        after: Option<Duration>,
    },
    /// Recovery requires operator action.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` if the next scheduled run can be expected to recover.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }

    /// Minimum back-off before retrying is useful, if one is known.
    pub fn after(&self) -> Option<Duration> {
        match self {
            RetryPolicy::Retryable { after } => *after,
            RetryPolicy::NonRetryable => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Release registry
// ---------------------------------------------------------------------------

/// Failures of [`ReleaseFetcher::fetch_latest`](crate::ports::ReleaseFetcher::fetch_latest).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// The project exists but has never published a release.
    ///
    /// A valid steady state; the engine folds it into `NoOp`.
    #[error("project '{project}' has no published releases")]
    NotFound {
        /// Project that was queried.
        project: ProjectId,
    },

    /// The registry does not know the project at all.
    ///
    /// Almost always a misconfigured identifier.
    #[error("project '{project}' does not exist in the release registry")]
    ProjectNotFound {
        /// Project that was queried.
        project: ProjectId,
    },

    /// Network failure, timeout, 5xx, or rate limiting.
    #[error("release registry unavailable: {message}")]
    Transient {
        /// Human-readable cause.
        message: String,
        /// Back-off hint from the registry, when it sent one.
        retry_after: Option<Duration>,
    },

    /// The registry answered, but not with a tag/timestamp pair.
    #[error("malformed release metadata: {message}")]
    MalformedResponse {
        /// What could not be parsed.
        message: String,
    },
}

impl FetchError {
    /// Returns the recovery expectation for this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            FetchError::Transient { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            FetchError::MalformedResponse { .. } | FetchError::NotFound { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            FetchError::ProjectNotFound { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Build trigger
// ---------------------------------------------------------------------------

/// Failures of [`BuildTrigger::trigger`](crate::ports::BuildTrigger::trigger).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TriggerError {
    /// The dispatch endpoint refused the request (bad credentials, unknown
    /// workflow, invalid inputs).
    #[error("dispatch rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by the endpoint.
        status: u16,
        /// Response body or description.
        message: String,
    },

    /// Network failure, timeout, 5xx, or rate limiting.
    #[error("dispatch endpoint unavailable: {message}")]
    Transient {
        /// Human-readable cause.
        message: String,
        /// Back-off hint, when one was sent.
        retry_after: Option<Duration>,
    },
}

impl TriggerError {
    /// Returns the recovery expectation for this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            TriggerError::Rejected { .. } => RetryPolicy::NonRetryable,
            TriggerError::Transient { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Watermark persistence
// ---------------------------------------------------------------------------

/// Failures of the [`WatermarkStore`](crate::ports::WatermarkStore).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The backing storage could not be read or written.
    #[error("watermark storage unavailable: {message}")]
    Unavailable {
        /// Human-readable cause, including the location involved.
        message: String,
    },

    /// Persisted state exists but cannot be decoded.
    #[error("watermark state is corrupt: {message}")]
    Corrupt {
        /// What could not be decoded.
        message: String,
    },

    /// The write would move the persisted watermark backwards.
    ///
    /// Raised when an overlapping run has already recorded a fresher value.
    #[error("refusing to move watermark back from {stored} to {attempted}")]
    Regression {
        /// Value currently persisted.
        stored: Watermark,
        /// Value the caller tried to write.
        attempted: Watermark,
    },

    /// Another run holds the project's run lock.
    #[error("run lock for '{project}' is held by {holder}")]
    Locked {
        /// Project whose lock is held.
        project: ProjectId,
        /// Description of the current holder (run id and acquisition time).
        holder: String,
    },
}

impl StoreError {
    /// Returns the recovery expectation for this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StoreError::Locked { .. } | StoreError::Regression { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            StoreError::Unavailable { .. } | StoreError::Corrupt { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process-level errors
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting or from being recorded at all.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The static configuration is invalid.
    ///
    /// Produced at load time; the watcher never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// Watermark storage failed outside an engine run (status, reset).
    #[error(transparent)]
    Persistence(#[from] StoreError),
}
