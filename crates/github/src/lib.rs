//! Release watcher GitHub infrastructure adapter.
//!
//! Implements the registry-facing and dispatch-facing traits defined in the
//! [`watcher`] crate (`ReleaseFetcher`, `BuildTrigger`) over the GitHub REST
//! API with `octocrab`. Requests go through octocrab's raw route methods so
//! rate-limit headers stay visible to the failure classification.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (status classification, rate-limit headers,
//! authentication, timeouts) are handled here; the [`watcher`] crate never
//! sees them.
//!
//! ## Endpoints
//!
//! | Port | Endpoint |
//! |------|----------|
//! | `ReleaseFetcher::fetch_latest` | `GET /repos/{owner}/{repo}/releases/latest` (+ `GET /repos/{owner}/{repo}` on 404) |
//! | `BuildTrigger::trigger` | `POST /repos/{owner}/{repo}/actions/workflows/{workflow}/dispatches` |
//!
//! Connecting and every read or write are bounded by
//! [`GithubConfig::timeout`]; expiry is reported as a transient failure. No
//! request is retried.

mod client;
mod dispatch;
mod releases;

pub use client::{GithubClient, GithubConfig, GithubError, DEFAULT_API_URL};
