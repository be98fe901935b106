use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use tracing::debug;

use crate::cmd::CommandRunner;

use super::{CompleteOutcome, NextOutcome, Task, TaskSource, TaskSourceKind};

#[derive(Debug, Deserialize)]
struct IssueListing {
    number: u64,
    title: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueState {
    state: String,
}

/// Remote issue-tracker back-end, delegating to the `gh` CLI.
pub struct GithubSource {
    workdir: PathBuf,
    repo: Option<String>,
    label: Option<String>,
    gh: Arc<dyn CommandRunner>,
}

impl GithubSource {
    pub fn new(
        workdir: PathBuf,
        repo: Option<String>,
        label: Option<String>,
        gh: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            workdir,
            repo,
            label,
            gh,
        }
    }

    fn list_issues(&self, state: &str) -> Result<Vec<IssueListing>> {
        let mut args = vec![
            "issue",
            "list",
            "--state",
            state,
            "--json",
            "number,title,url",
        ];
        if let Some(label) = &self.label {
            args.push("--label");
            args.push(label);
        }
        if let Some(repo) = &self.repo {
            args.push("--repo");
            args.push(repo);
        }

        let output = self.gh.run(&self.workdir, &args)?;
        if !output.success() {
            return Err(anyhow!(output.error_message()));
        }
        let issues: Vec<IssueListing> = serde_json::from_str(output.stdout.trim())
            .map_err(|e| anyhow!("Failed to parse issue listing: {}", e))?;
        Ok(issues)
    }

    fn issue_state(&self, number: u64) -> Result<String> {
        let number = number.to_string();
        let mut args = vec!["issue", "view", number.as_str(), "--json", "state"];
        if let Some(repo) = &self.repo {
            args.push("--repo");
            args.push(repo);
        }

        let output = self.gh.run(&self.workdir, &args)?;
        if !output.success() {
            return Err(anyhow!(output.error_message()));
        }
        let state: IssueState = serde_json::from_str(output.stdout.trim())
            .map_err(|e| anyhow!("Failed to parse issue state: {}", e))?;
        Ok(state.state)
    }

    fn close_issue(&self, number: u64) -> Result<()> {
        let number = number.to_string();
        let mut args = vec!["issue", "close", number.as_str()];
        if let Some(repo) = &self.repo {
            args.push("--repo");
            args.push(repo);
        }

        let output = self.gh.run(&self.workdir, &args)?;
        if !output.success() {
            return Err(anyhow!(output.error_message()));
        }
        Ok(())
    }
}

impl TaskSource for GithubSource {
    fn kind(&self) -> TaskSourceKind {
        TaskSourceKind::Github
    }

    fn next(&self) -> NextOutcome {
        match self.list_issues("open") {
            Ok(issues) => match issues.into_iter().next() {
                Some(issue) => NextOutcome::Ok {
                    task: Task {
                        source: TaskSourceKind::Github,
                        text: issue.title,
                        line: None,
                        url: issue.url,
                        number: Some(issue.number),
                        group: None,
                        completed: false,
                    },
                },
                None => NextOutcome::Empty {
                    source: TaskSourceKind::Github,
                },
            },
            Err(err) => NextOutcome::Error {
                source: TaskSourceKind::Github,
                message: err.to_string(),
            },
        }
    }

    fn complete(&self, title: &str) -> CompleteOutcome {
        let target = title.trim();

        let issues = match self.list_issues("all") {
            Ok(issues) => issues,
            Err(err) => {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Github,
                    message: err.to_string(),
                };
            }
        };

        let Some(issue) = issues.iter().find(|i| i.title.trim() == target) else {
            return CompleteOutcome::NotFound {
                source: TaskSourceKind::Github,
                task: target.to_string(),
            };
        };

        let state = match self.issue_state(issue.number) {
            Ok(state) => state,
            Err(err) => {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Github,
                    message: err.to_string(),
                };
            }
        };

        if !state.eq_ignore_ascii_case("open") {
            return CompleteOutcome::AlreadyComplete {
                source: TaskSourceKind::Github,
                task: target.to_string(),
            };
        }

        match self.close_issue(issue.number) {
            Ok(()) => {
                debug!(task = target, number = issue.number, "github:issue closed");
                CompleteOutcome::Updated {
                    source: TaskSourceKind::Github,
                    task: target.to_string(),
                }
            }
            Err(err) => CompleteOutcome::Error {
                source: TaskSourceKind::Github,
                message: err.to_string(),
            },
        }
    }

    /// Issue-tracker tasks carry no grouping; the parallel scheduler rejects
    /// this source before ever calling here.
    fn list(&self) -> Result<Vec<Task>> {
        Err(anyhow!("GitHub issues cannot be listed for grouping"))
    }
}
