use serde::{Deserialize, Serialize};

use crate::agent::Engine;
use crate::agent::executor::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};
use crate::agent::output::Usage;
use crate::prompt::PromptMode;
use crate::task::{SourceOptions, TaskSourceKind};

/// Where a PRD run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    TaskSource,
    Agent,
    Complete,
    Pr,
    Merge,
}

/// Why a PRD run stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    NoTasks,
    MaxIterations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRunStatus {
    Completed,
    Failed,
}

/// One attempted task, in the order tasks were attempted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub task: String,
    pub source: TaskSourceKind,
    pub status: TaskRunStatus,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for a PRD run, shared by the sequential loop and the parallel
/// scheduler. Deserialises from the HTTP payload; missing fields take the
/// defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrdOptions {
    #[serde(flatten)]
    pub source: SourceOptions,
    pub max_iterations: Option<usize>,
    pub max_retries: usize,
    pub retry_delay: u64,
    pub branch_per_task: bool,
    pub base_branch: Option<String>,
    pub create_pr: bool,
    pub draft_pr: bool,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_commit: bool,
    pub dry_run: bool,
    pub parallel: bool,
    pub max_parallel: Option<usize>,
    pub engine: Engine,
}

impl Default for PrdOptions {
    fn default() -> Self {
        Self {
            source: SourceOptions::default(),
            max_iterations: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            branch_per_task: false,
            base_branch: None,
            create_pr: false,
            draft_pr: false,
            skip_tests: false,
            skip_lint: false,
            auto_commit: true,
            dry_run: false,
            parallel: false,
            max_parallel: None,
            engine: Engine::default(),
        }
    }
}

/// Options for a single ad-hoc task run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SingleOptions {
    pub task: String,
    pub engine: Engine,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_commit: bool,
    pub dry_run: bool,
    pub max_retries: usize,
    pub retry_delay: u64,
    pub prompt_mode: PromptMode,
    pub task_source: Option<TaskSourceKind>,
    pub task_source_path: Option<String>,
    pub issue_body: Option<String>,
}

impl Default for SingleOptions {
    fn default() -> Self {
        Self {
            task: String::new(),
            engine: Engine::default(),
            skip_tests: false,
            skip_lint: false,
            auto_commit: true,
            dry_run: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            prompt_mode: PromptMode::default(),
            task_source: None,
            task_source_path: None,
            issue_body: None,
        }
    }
}

/// Requirements failures, reported before any work starts.
#[derive(Debug, Serialize)]
pub struct PreflightReport {
    pub status: RunStatus,
    pub failures: Vec<String>,
}

/// Outcome of a PRD run: accumulated state plus either a stop reason or the
/// first stage error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdReport {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub iterations: usize,
    pub completed: usize,
    pub tasks: Vec<TaskRun>,
    pub usage: Usage,
}

impl PrdReport {
    pub fn empty_ok(stopped: StopReason) -> Self {
        Self {
            status: RunStatus::Ok,
            stopped: Some(stopped),
            stage: None,
            message: None,
            task: None,
            iterations: 0,
            completed: 0,
            tasks: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn stage_error(stage: Stage, message: impl Into<String>, task: Option<String>) -> Self {
        Self {
            status: RunStatus::Error,
            stopped: None,
            stage: Some(stage),
            message: Some(message.into()),
            task,
            iterations: 0,
            completed: 0,
            tasks: Vec::new(),
            usage: Usage::default(),
        }
    }
}

/// A PRD call resolves to a requirements report or a run report.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PrdOutcome {
    Preflight(PreflightReport),
    Report(PrdReport),
}

impl PrdOutcome {
    pub fn preflight(failures: Vec<String>) -> Self {
        PrdOutcome::Preflight(PreflightReport {
            status: RunStatus::Error,
            failures,
        })
    }
}
