//! Subcommand implementations.
//!
//! Each command returns its rendered output and a process exit code; `main`
//! owns stdout.

use std::sync::Arc;

use github::GithubClient;
use serde_json::json;
use store::{FileWatermarkStore, LockRecord, WatermarkRecord};
use tracing::info;
use watcher::{
    DispatchEngine, EngineConfig, ProjectId, RunId, RunMode, RunOutcome, RunReport, Watermark,
    WatcherError, WatermarkStore,
};

use crate::config::{parse_reset_target, Settings, TargetArgs};

/// Rendered command result.
#[derive(Debug)]
pub struct Output {
    pub text: String,
    pub exit_code: i32,
}

fn open_store(settings: &Settings) -> FileWatermarkStore {
    FileWatermarkStore::new(&settings.state_dir).with_lock_ttl(settings.lock_ttl)
}

/// `run` and `check`: one engine pass in the given mode.
pub async fn watch(
    settings: &Settings,
    args: &TargetArgs,
    mode: RunMode,
    json: bool,
) -> Result<Output, WatcherError> {
    if mode == RunMode::Dispatch {
        settings.require_token()?;
    }
    let target = args.target()?;
    let client = Arc::new(GithubClient::new(settings.github.clone()).map_err(|e| {
        WatcherError::ConfigurationError {
            message: e.to_string(),
        }
    })?);

    let engine = DispatchEngine::new(
        EngineConfig {
            project: settings.project.clone(),
            target,
            policy: args.policy,
        },
        Arc::new(open_store(settings)),
        client.clone(),
        client,
    );

    let report = engine.run(mode).await;
    Ok(Output {
        text: render_report(&report, json),
        exit_code: report.outcome.exit_code(),
    })
}

/// `status`: stored watermark and lock state.
pub async fn status(settings: &Settings, json: bool) -> Result<Output, WatcherError> {
    let store = open_store(settings);
    let record = store.inspect(&settings.project).await?;
    let holder = store.lock_holder(&settings.project).await?;
    Ok(Output {
        text: render_status(&settings.project, record.as_ref(), holder.as_ref(), json),
        exit_code: 0,
    })
}

/// `reset`: overwrite the watermark under the run lock.
pub async fn reset(
    settings: &Settings,
    to: Option<&str>,
    json: bool,
) -> Result<Output, WatcherError> {
    let watermark = parse_reset_target(to)?;
    let store = open_store(settings);
    let run_id = RunId::new_random();
    let project = &settings.project;

    store.lock(project, run_id).await?;
    let result = store.reset(project, watermark, run_id).await;
    if let Err(err) = store.unlock(project, run_id).await {
        tracing::warn!(%project, %run_id, error = %err, "failed to release run lock after reset");
    }
    result?;

    info!(%project, %run_id, %watermark, "watermark reset");
    let text = if json {
        json!({ "project": project, "watermark": watermark_json(watermark) }).to_string()
    } else {
        format!("{project}: watermark reset to {watermark}")
    };
    Ok(Output { text, exit_code: 0 })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn watermark_json(watermark: Watermark) -> serde_json::Value {
    match watermark.timestamp() {
        Some(at) => json!(at.to_string()),
        None => serde_json::Value::Null,
    }
}

fn render_report(report: &RunReport, json: bool) -> String {
    if json {
        let failure = match &report.outcome {
            RunOutcome::Failed(reason) => {
                let policy = reason.retry_policy();
                json!({
                    "reason": reason.label(),
                    "message": reason.to_string(),
                    "retryable": policy.is_retryable(),
                    "retry_after_secs": policy.after().map(|d| d.as_secs()),
                })
            }
            _ => serde_json::Value::Null,
        };
        return json!({
            "run_id": report.run_id.to_string(),
            "project": report.project,
            "mode": report.mode.to_string(),
            "run_start": report.run_start.to_string(),
            "previous_watermark": report.previous.map(watermark_json),
            "release": report.release.as_ref().map(|r| json!({
                "tag": r.tag,
                "published_at": r.published_at.to_string(),
            })),
            "recorded_watermark": report.recorded.map(watermark_json),
            "outcome": report.outcome.label(),
            "failure": failure,
        })
        .to_string();
    }

    let dry = if report.mode == RunMode::DryRun {
        " (dry run)"
    } else {
        ""
    };
    let mut line = match &report.outcome {
        RunOutcome::Triggered(tag) if report.mode == RunMode::DryRun => {
            format!("{}: would trigger {tag}{dry}", report.project)
        }
        RunOutcome::Triggered(tag) => format!("{}: triggered {tag}", report.project),
        RunOutcome::NoOp => format!("{}: no new release{dry}", report.project),
        RunOutcome::Failed(reason) => {
            format!("{}: failed ({}): {reason}", report.project, reason.label())
        }
    };
    if let Some(release) = &report.release {
        line.push_str(&format!(
            "\n  latest release: {} published {}",
            release.tag, release.published_at
        ));
    }
    if let Some(previous) = report.previous {
        line.push_str(&format!("\n  watermark: {previous}"));
        if let Some(recorded) = report.recorded {
            line.push_str(&format!(" -> {recorded}"));
        }
    }
    line
}

fn render_status(
    project: &ProjectId,
    record: Option<&WatermarkRecord>,
    holder: Option<&LockRecord>,
    json: bool,
) -> String {
    let watermark = record.map(WatermarkRecord::watermark).unwrap_or(Watermark::Never);
    if json {
        return json!({
            "project": project,
            "watermark": watermark_json(watermark),
            "updated_at": record.map(|r| r.updated_at.to_string()),
            "written_by": record.map(|r| r.written_by.to_string()),
            "lock": holder.map(|h| json!({
                "run_id": h.run_id.to_string(),
                "pid": h.pid,
                "acquired_at": h.acquired_at.to_string(),
            })),
        })
        .to_string();
    }

    let mut text = format!("{project}\n  watermark: {watermark}");
    if let Some(record) = record {
        text.push_str(&format!(
            "\n  updated:   {} by run {}",
            record.updated_at, record.written_by
        ));
    }
    match holder {
        Some(holder) => text.push_str(&format!("\n  lock:      held by {holder}")),
        None => text.push_str("\n  lock:      free"),
    }
    text
}
