pub mod github;
pub mod markdown;
pub mod yaml;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cmd::CommandRunner;

/// Default Markdown backlog path.
pub const DEFAULT_PRD_PATH: &str = "PRD.md";

/// Which back-end a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSourceKind {
    Markdown,
    Yaml,
    Github,
}

impl std::fmt::Display for TaskSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskSourceKind::Markdown => write!(f, "markdown"),
            TaskSourceKind::Yaml => write!(f, "yaml"),
            TaskSourceKind::Github => write!(f, "github"),
        }
    }
}

/// A single backlog entry. Identity is the trimmed `text`; there is no UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub source: TaskSourceKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u64>,
    pub completed: bool,
}

/// Result of asking a source for its next incomplete task.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum NextOutcome {
    Ok { task: Task },
    Empty { source: TaskSourceKind },
    Error { source: TaskSourceKind, message: String },
}

/// Result of marking a task complete at its source.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CompleteOutcome {
    Updated {
        source: TaskSourceKind,
        task: String,
    },
    AlreadyComplete {
        source: TaskSourceKind,
        task: String,
    },
    NotFound {
        source: TaskSourceKind,
        task: String,
    },
    Error {
        source: TaskSourceKind,
        message: String,
    },
}

/// Uniform next/complete contract over the three back-ends.
///
/// Infrastructure failures (I/O, subprocess) are folded into the `Error`
/// outcomes here; only `list` propagates, because the parallel scheduler
/// needs to distinguish a missing file from an empty backlog up front.
pub trait TaskSource: Send + Sync {
    fn kind(&self) -> TaskSourceKind;
    fn next(&self) -> NextOutcome;
    fn complete(&self, title: &str) -> CompleteOutcome;
    fn list(&self) -> Result<Vec<Task>>;
}

/// Back-end selection options, as they arrive from the CLI or HTTP payloads.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceOptions {
    pub prd: Option<String>,
    pub yaml: Option<String>,
    pub github: Option<String>,
    pub github_label: Option<String>,
}

// Empty query-string values ("?prd=&yaml=") mean "not set".
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SourceOptions {
    /// The file path backing this source, for file-based back-ends.
    pub fn file_path(&self, cwd: &Path) -> Option<PathBuf> {
        if non_empty(&self.github).is_some() {
            return None;
        }
        let rel = non_empty(&self.yaml)
            .or_else(|| non_empty(&self.prd))
            .unwrap_or(DEFAULT_PRD_PATH);
        Some(cwd.join(rel))
    }

    pub fn kind(&self) -> TaskSourceKind {
        if non_empty(&self.github).is_some() {
            TaskSourceKind::Github
        } else if non_empty(&self.yaml).is_some() {
            TaskSourceKind::Yaml
        } else {
            TaskSourceKind::Markdown
        }
    }
}

/// Choose the adapter by precedence: github > yaml > markdown (default PRD.md).
pub fn select_source(
    opts: &SourceOptions,
    cwd: &Path,
    gh: Arc<dyn CommandRunner>,
) -> Box<dyn TaskSource> {
    if let Some(repo_or_flag) = non_empty(&opts.github) {
        return Box::new(github::GithubSource::new(
            cwd.to_path_buf(),
            normalize_repo(repo_or_flag),
            non_empty(&opts.github_label).map(str::to_string),
            gh,
        ));
    }
    match opts.file_path(cwd) {
        Some(path) if opts.kind() == TaskSourceKind::Yaml => {
            Box::new(yaml::YamlSource::new(path))
        }
        Some(path) => Box::new(markdown::MarkdownSource::new(path)),
        // Unreachable in practice: github was handled above.
        None => Box::new(markdown::MarkdownSource::new(cwd.join(DEFAULT_PRD_PATH))),
    }
}

// A bare "true" (e.g. from a flag used without a value) means "current repo".
fn normalize_repo(value: &str) -> Option<String> {
    if value == "true" {
        None
    } else {
        Some(value.to_string())
    }
}
