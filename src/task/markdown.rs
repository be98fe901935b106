use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::{CompleteOutcome, NextOutcome, Task, TaskSource, TaskSourceKind};

/// One checkbox line: indentation, `-` or `*` marker, `[ ]`/`[x]`/`[X]`, title.
static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\t ]*[-*][\t ]+\[( |x|X)\][\t ]+(.*)$").expect("valid checkbox regex")
});

/// Markdown checklist back-end (the classic PRD.md).
pub struct MarkdownSource {
    path: PathBuf,
}

impl MarkdownSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read task file: {}", self.path.display()))
    }

    fn parse(&self, content: &str) -> Vec<Task> {
        content
            .split('\n')
            .enumerate()
            .filter_map(|(idx, line)| {
                let caps = CHECKBOX_RE.captures(line)?;
                let status = caps.get(1).map(|m| m.as_str()).unwrap_or(" ");
                let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
                Some(Task {
                    source: TaskSourceKind::Markdown,
                    text: text.to_string(),
                    line: Some(idx + 1),
                    url: None,
                    number: None,
                    group: None,
                    completed: matches!(status, "x" | "X"),
                })
            })
            .collect()
    }
}

impl TaskSource for MarkdownSource {
    fn kind(&self) -> TaskSourceKind {
        TaskSourceKind::Markdown
    }

    fn next(&self) -> NextOutcome {
        let content = match self.read() {
            Ok(content) => content,
            Err(err) => {
                return NextOutcome::Error {
                    source: TaskSourceKind::Markdown,
                    message: err.to_string(),
                };
            }
        };

        match self.parse(&content).into_iter().find(|t| !t.completed) {
            Some(task) => NextOutcome::Ok { task },
            None => NextOutcome::Empty {
                source: TaskSourceKind::Markdown,
            },
        }
    }

    fn complete(&self, title: &str) -> CompleteOutcome {
        let target = title.trim();
        let content = match self.read() {
            Ok(content) => content,
            Err(err) => {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Markdown,
                    message: err.to_string(),
                };
            }
        };

        let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
        let mut found_complete = false;

        for idx in 0..lines.len() {
            let Some(caps) = CHECKBOX_RE.captures(&lines[idx]) else {
                continue;
            };
            let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            if text != target {
                continue;
            }

            let Some(status) = caps.get(1) else {
                continue;
            };
            if matches!(status.as_str(), "x" | "X") {
                found_complete = true;
                continue;
            }

            // Rewrite only the status character; the marker and indentation
            // of the matched line are preserved verbatim.
            let line = &lines[idx];
            let updated = format!("{}x{}", &line[..status.start()], &line[status.end()..]);
            lines[idx] = updated;

            if let Err(err) = fs::write(&self.path, lines.join("\n")) {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Markdown,
                    message: format!(
                        "Failed to write task file {}: {}",
                        self.path.display(),
                        err
                    ),
                };
            }

            debug!(task = target, line = idx + 1, "markdown:task completed");
            return CompleteOutcome::Updated {
                source: TaskSourceKind::Markdown,
                task: target.to_string(),
            };
        }

        if found_complete {
            CompleteOutcome::AlreadyComplete {
                source: TaskSourceKind::Markdown,
                task: target.to_string(),
            }
        } else {
            CompleteOutcome::NotFound {
                source: TaskSourceKind::Markdown,
                task: target.to_string(),
            }
        }
    }

    fn list(&self) -> Result<Vec<Task>> {
        Ok(self.parse(&self.read()?))
    }
}
