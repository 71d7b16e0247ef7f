//! Command-line surface and static configuration.
//!
//! Every setting can come from a flag or its environment variable, so the
//! same binary runs unchanged from a cron entry, a CI schedule, or a shell.
//! Validation happens once, before any I/O.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use github::{GithubConfig, DEFAULT_API_URL};
use watcher::{
    GitRef, InputName, PipelineTarget, ProjectId, RepositoryId, Timestamp, Watermark,
    WatcherError, WatermarkPolicy, WorkflowId,
};

#[derive(Debug, Parser)]
#[command(
    name = "release-watcher",
    about = "Poll an upstream project's latest release and dispatch a build pipeline once per new release",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Upstream project to watch, as owner/repo
    #[arg(long, global = true, env = "WATCHER_PROJECT")]
    pub project: Option<String>,

    /// Directory holding watermark state and run locks
    #[arg(long, global = true, env = "WATCHER_STATE_DIR", default_value = ".release-watcher")]
    pub state_dir: PathBuf,

    /// GitHub REST API base URL
    #[arg(long, global = true, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// GitHub token (required to dispatch workflows)
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Upper bound in seconds for each registry or dispatch request
    #[arg(long, global = true, env = "WATCHER_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Age in seconds after which a run lock is considered abandoned
    #[arg(long, global = true, env = "WATCHER_LOCK_TTL_SECS", default_value_t = 900)]
    pub lock_ttl_secs: u64,

    /// Log output format (logs go to stderr)
    #[arg(long, global = true, env = "WATCHER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print results as JSON
    #[arg(long, global = true, short = 'j')]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check for a new release and dispatch the pipeline if one appeared
    Run(TargetArgs),

    /// Show what `run` would decide, without dispatching or recording anything
    Check(TargetArgs),

    /// Show the stored watermark and lock state
    Status,

    /// Clear the watermark, or set it to an explicit instant
    Reset {
        /// New watermark (RFC 3339); omit to forget all prior checks
        #[arg(long)]
        to: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Repository hosting the build workflow, as owner/repo
    #[arg(long, env = "WATCHER_TARGET_REPO")]
    pub target_repo: Option<String>,

    /// Workflow file name or id to dispatch
    #[arg(long, env = "WATCHER_WORKFLOW")]
    pub workflow: Option<String>,

    /// Git ref the workflow runs on
    #[arg(long = "ref", env = "WATCHER_REF", default_value = "main")]
    pub git_ref: String,

    /// Workflow input that receives the release tag
    #[arg(long, env = "WATCHER_TAG_INPUT", default_value = "release_tag")]
    pub tag_input: String,

    /// How the watermark advances after a successful run
    #[arg(long, env = "WATCHER_POLICY", default_value = "run-start")]
    pub policy: WatermarkPolicy,
}

// ---------------------------------------------------------------------------
// Validated settings
// ---------------------------------------------------------------------------

/// Settings shared by every subcommand, after validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project: ProjectId,
    pub state_dir: PathBuf,
    pub github: GithubConfig,
    pub lock_ttl: Duration,
}

impl Settings {
    pub fn from_args(args: &GlobalArgs) -> Result<Self, WatcherError> {
        let project = args
            .project
            .as_deref()
            .ok_or_else(|| config_error("--project (or WATCHER_PROJECT) is required"))?;
        let project = ProjectId::parse(project)
            .ok_or_else(|| config_error(format!("project '{project}' is not in owner/repo form")))?;

        if args.timeout_secs == 0 {
            return Err(config_error("--timeout-secs must be greater than zero"));
        }

        Ok(Self {
            project,
            state_dir: args.state_dir.clone(),
            github: GithubConfig {
                api_url: args.api_url.clone(),
                token: args.token.clone(),
                timeout: Duration::from_secs(args.timeout_secs),
            },
            lock_ttl: Duration::from_secs(args.lock_ttl_secs),
        })
    }

    /// Fails unless a non-blank token is configured.
    pub fn require_token(&self) -> Result<(), WatcherError> {
        match self.github.token.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(()),
            _ => Err(config_error(
                "a GitHub token (--token or GITHUB_TOKEN) is required to dispatch workflows",
            )),
        }
    }
}

impl TargetArgs {
    pub fn target(&self) -> Result<PipelineTarget, WatcherError> {
        let repo = self
            .target_repo
            .as_deref()
            .ok_or_else(|| config_error("--target-repo (or WATCHER_TARGET_REPO) is required"))?;
        let repository = RepositoryId::parse(repo)
            .ok_or_else(|| config_error(format!("target repo '{repo}' is not in owner/repo form")))?;
        let workflow = self
            .workflow
            .as_deref()
            .and_then(WorkflowId::new)
            .ok_or_else(|| config_error("--workflow (or WATCHER_WORKFLOW) is required"))?;
        if !is_workflow_segment(workflow.as_str()) {
            return Err(config_error(format!(
                "workflow '{workflow}' must be a workflow file name (e.g. build.yml) or a numeric id"
            )));
        }
        let git_ref =
            GitRef::new(self.git_ref.as_str()).ok_or_else(|| config_error("--ref must not be empty"))?;
        let tag_input = InputName::new(self.tag_input.as_str())
            .ok_or_else(|| config_error("--tag-input must not be empty"))?;

        Ok(PipelineTarget {
            repository,
            workflow,
            git_ref,
            tag_input,
        })
    }
}

/// The workflow id is a single URL path segment: a file name such as
/// `build.yml` or a numeric id.
fn is_workflow_segment(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != ".."
}

/// Parses the `reset --to` argument.
pub fn parse_reset_target(to: Option<&str>) -> Result<Watermark, WatcherError> {
    match to {
        None => Ok(Watermark::Never),
        Some(raw) => Timestamp::parse_rfc3339(raw)
            .map(Watermark::CheckedAt)
            .ok_or_else(|| config_error(format!("'{raw}' is not an RFC 3339 timestamp"))),
    }
}

fn config_error(message: impl Into<String>) -> WatcherError {
    WatcherError::ConfigurationError {
        message: message.into(),
    }
}
