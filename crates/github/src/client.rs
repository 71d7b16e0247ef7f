//! Shared plumbing: `Octocrab` construction and classification of
//! non-success responses into the watcher's failure kinds.

use std::time::Duration;

use http::header::{HeaderName, ACCEPT, RETRY_AFTER};
use http::{HeaderMap, StatusCode};
use octocrab::service::middleware::retry::RetryConfig;
use octocrab::Octocrab;
use thiserror::Error;

/// Public GitHub REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";

/// Errors raised while constructing a [`GithubClient`].
#[derive(Debug, Error)]
pub enum GithubError {
    /// The configured API base URL is not an absolute http(s) URL.
    #[error("invalid GitHub API URL '{0}'")]
    InvalidBaseUrl(String),

    /// The underlying GitHub client could not be built (e.g. TLS backend init).
    #[error("failed to build GitHub client: {0}")]
    Octocrab(#[from] octocrab::Error),
}

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// REST API base URL, without a trailing slash.
    pub api_url: String,
    /// Personal or Actions token. Optional for public reads; dispatch needs
    /// `actions:write` on the target repository.
    pub token: Option<String>,
    /// Bound on connecting and on every read or write of a request.
    pub timeout: Duration,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// GitHub client implementing both watcher ports.
///
/// The [`watcher::ReleaseFetcher`] implementation lives in `releases.rs`,
/// [`watcher::BuildTrigger`] in `dispatch.rs`.
#[derive(Clone)]
pub struct GithubClient {
    pub(crate) octocrab: Octocrab,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient").finish_non_exhaustive()
    }
}

impl GithubClient {
    /// Builds a client from `config`.
    ///
    /// Octocrab's own retry layer is disabled: a failed request fails the run
    /// and the next scheduled run is the retry.
    pub fn new(config: GithubConfig) -> Result<Self, GithubError> {
        let api_url = config.api_url.trim_end_matches('/');
        if !(api_url.starts_with("https://") || api_url.starts_with("http://")) {
            return Err(GithubError::InvalidBaseUrl(config.api_url));
        }

        let mut builder = Octocrab::builder()
            .base_uri(api_url)?
            .add_header(ACCEPT, MEDIA_TYPE.to_string())
            .add_header(
                HeaderName::from_static("x-github-api-version"),
                API_VERSION.to_string(),
            )
            .add_retry_config(RetryConfig::None)
            .set_connect_timeout(Some(config.timeout))
            .set_read_timeout(Some(config.timeout))
            .set_write_timeout(Some(config.timeout));

        if let Some(token) = config.token.filter(|t| !t.trim().is_empty()) {
            builder = builder.personal_token(token);
        }

        Ok(Self {
            octocrab: builder.build()?,
        })
    }
}

/// Formats a request that produced no HTTP response (connect failure,
/// timeout, TLS error).
pub(crate) fn describe_transport_error(err: &octocrab::Error) -> String {
    format!("request failed: {err}")
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// How a non-success response should be treated by the ports.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Failure {
    /// Worth trying again at the next scheduled run.
    Transient {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// The request itself is wrong; repeating it will not help.
    Permanent { status: u16 },
}

/// Classifies a non-success status.
///
/// 5xx, 429, and 403 with an exhausted rate limit are transient; every other
/// 4xx is permanent.
pub(crate) fn classify(status: StatusCode, headers: &HeaderMap) -> Failure {
    let code = status.as_u16();
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limit_exhausted(headers));

    if rate_limited || status.is_server_error() {
        Failure::Transient {
            status: code,
            retry_after: retry_after(headers),
        }
    } else {
        Failure::Permanent { status: code }
    }
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    header_str(headers, "x-ratelimit-remaining") == Some("0") || headers.contains_key(RETRY_AFTER)
}

/// Reads `Retry-After` (seconds) or, failing that, `x-ratelimit-reset`
/// (epoch seconds).
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_str(headers, "x-ratelimit-reset")?.parse::<i64>().ok()?;
    let wait = reset - chrono::Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Trims a failed response body for diagnostics.
pub(crate) fn truncate_body(text: &str) -> String {
    const LIMIT: usize = 512;
    let text = text.trim();
    if text.len() > LIMIT {
        let mut cut = LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    } else {
        text.to_string()
    }
}
