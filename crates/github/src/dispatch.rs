//! [`BuildTrigger`] over `POST /repos/{owner}/{repo}/actions/workflows/{workflow}/dispatches`.
//!
//! GitHub answers `204 No Content` once the `workflow_dispatch` event is
//! accepted. The resulting workflow run is not tracked.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};
use watcher::{BuildTrigger, PipelineTarget, ReleaseInfo, TriggerError};

use crate::client::{classify, describe_transport_error, truncate_body, Failure, GithubClient};

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: HashMap<&'a str, &'a str>,
}

#[async_trait]
impl BuildTrigger for GithubClient {
    #[instrument(skip_all, fields(pipeline = %target, tag = %release.tag))]
    async fn trigger(
        &self,
        target: &PipelineTarget,
        release: &ReleaseInfo,
    ) -> Result<(), TriggerError> {
        let route = format!(
            "/repos/{}/{}/actions/workflows/{}/dispatches",
            target.repository.owner(),
            target.repository.name(),
            target.workflow
        );
        let body = DispatchRequest {
            git_ref: target.git_ref.as_str(),
            inputs: HashMap::from([(target.tag_input.as_str(), release.tag.as_str())]),
        };

        let response = self
            .octocrab
            ._post(route, Some(&body))
            .await
            .map_err(|e| TriggerError::Transient {
                message: describe_transport_error(&e),
                retry_after: None,
            })?;

        let status = response.status();
        if status.is_success() {
            info!(status = status.as_u16(), "workflow dispatch accepted");
            return Ok(());
        }

        let failure = classify(status, response.headers());
        let text = self.octocrab.body_to_string(response).await.unwrap_or_default();
        let message = truncate_body(&text);
        Err(match failure {
            Failure::Transient {
                status,
                retry_after,
            } => TriggerError::Transient {
                message: format!("status {status}: {message}"),
                retry_after,
            },
            Failure::Permanent { status } => TriggerError::Rejected { status, message },
        })
    }
}
