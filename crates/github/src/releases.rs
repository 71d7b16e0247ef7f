//! [`ReleaseFetcher`] over `GET /repos/{owner}/{repo}/releases/latest`.
//!
//! GitHub's "latest" is the most recently published, non-draft,
//! non-prerelease release. That ordering is taken as given; tags are never
//! compared.

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};
use watcher::{FetchError, ProjectId, ReleaseFetcher, ReleaseInfo, ReleaseTag, Timestamp};

use crate::client::{classify, describe_transport_error, truncate_body, Failure, GithubClient};

/// Subset of the release payload the watcher relies on.
#[derive(Debug, Deserialize)]
struct ReleasePayload {
    tag_name: Option<String>,
    published_at: Option<String>,
}

impl ReleasePayload {
    fn into_release(self) -> Result<ReleaseInfo, FetchError> {
        let tag = self
            .tag_name
            .and_then(ReleaseTag::new)
            .ok_or_else(|| malformed("tag_name is missing or empty"))?;
        let raw = self
            .published_at
            .ok_or_else(|| malformed(format!("release {tag} has no published_at")))?;
        let published_at = Timestamp::parse_rfc3339(&raw)
            .ok_or_else(|| malformed(format!("published_at '{raw}' is not RFC 3339")))?;
        Ok(ReleaseInfo { tag, published_at })
    }
}

fn malformed(message: impl Into<String>) -> FetchError {
    FetchError::MalformedResponse {
        message: message.into(),
    }
}

fn transient_fetch(err: &octocrab::Error) -> FetchError {
    FetchError::Transient {
        message: describe_transport_error(err),
        retry_after: None,
    }
}

impl GithubClient {
    /// Tells "repository missing" apart from "repository has no releases",
    /// both of which GitHub reports as 404 on the latest-release endpoint.
    async fn repository_exists(&self, project: &ProjectId) -> Result<bool, FetchError> {
        let route = format!("/repos/{}/{}", project.owner(), project.name());
        let response = self
            .octocrab
            ._get(route)
            .await
            .map_err(|e| transient_fetch(&e))?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let retry_after = retry_after_of(classify(status, response.headers()));
                let body = self.octocrab.body_to_string(response).await.unwrap_or_default();
                Err(fetch_failure(status, retry_after, &body))
            }
        }
    }
}

fn retry_after_of(failure: Failure) -> Option<std::time::Duration> {
    match failure {
        Failure::Transient { retry_after, .. } => retry_after,
        Failure::Permanent { .. } => None,
    }
}

// 401/403 land here too: reported as transient so the run fails without
// touching the watermark.
fn fetch_failure(
    status: StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> FetchError {
    FetchError::Transient {
        message: format!("status {}: {}", status.as_u16(), truncate_body(body)),
        retry_after,
    }
}

#[async_trait]
impl ReleaseFetcher for GithubClient {
    #[instrument(skip_all, fields(project = %project))]
    async fn fetch_latest(&self, project: &ProjectId) -> Result<ReleaseInfo, FetchError> {
        let route = format!(
            "/repos/{}/{}/releases/latest",
            project.owner(),
            project.name()
        );
        let response = self
            .octocrab
            ._get(route)
            .await
            .map_err(|e| transient_fetch(&e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return if self.repository_exists(project).await? {
                Err(FetchError::NotFound {
                    project: project.clone(),
                })
            } else {
                Err(FetchError::ProjectNotFound {
                    project: project.clone(),
                })
            };
        }
        if !status.is_success() {
            let retry_after = retry_after_of(classify(status, response.headers()));
            let body = self.octocrab.body_to_string(response).await.unwrap_or_default();
            return Err(fetch_failure(status, retry_after, &body));
        }

        let body = self
            .octocrab
            .body_to_string(response)
            .await
            .map_err(|e| transient_fetch(&e))?;
        let payload: ReleasePayload = serde_json::from_str(&body)
            .map_err(|e| malformed(format!("release payload is not valid JSON: {e}")))?;
        let release = payload.into_release()?;

        debug!(tag = %release.tag, published_at = %release.published_at, "fetched latest release");
        Ok(release)
    }
}
