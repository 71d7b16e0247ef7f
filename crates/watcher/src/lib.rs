//! Core domain for the release watcher.
//!
//! This crate contains the dispatch decision engine together with every domain
//! concept, newtype identifier, value type, and error type it uses.
//! Infrastructure crates implement the port traits defined here; they never
//! add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`ProjectId`, `ReleaseTag`, `RunId`, etc.) |
//! | [`types`] | Value types (`Timestamp`, `Watermark`, `ReleaseInfo`, `WatermarkPolicy`, etc.) |
//! | [`errors`] | Per-port error types and the retry-policy type |
//! | [`ports`] | `WatermarkStore`, `ReleaseFetcher`, `BuildTrigger`, `Clock` |
//! | [`engine`] | `DispatchEngine` and run outcomes |

pub mod engine;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use engine::{
    DispatchEngine, EngineConfig, FailureReason, RunMode, RunOutcome, RunReport,
};
pub use errors::{FetchError, RetryPolicy, StoreError, TriggerError, WatcherError};
pub use identifiers::{
    GitRef, InputName, ProjectId, ReleaseTag, RepositoryId, RunId, WorkflowId,
};
pub use ports::{BuildTrigger, Clock, ReleaseFetcher, SystemClock, WatermarkStore};
pub use types::{PipelineTarget, ReleaseInfo, Timestamp, Watermark, WatermarkPolicy};
