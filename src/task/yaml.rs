use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::debug;

use super::{CompleteOutcome, NextOutcome, Task, TaskSource, TaskSourceKind};

static TASKS_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)tasks:\s*$").expect("valid header regex"));

static DASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)-\s+(.*)$").expect("valid dash regex"));

static PROP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*)$").expect("valid prop regex"));

static COMPLETED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*completed\s*:\s*)("[^"]*"|'[^']*'|[^\s#]+)?(.*)$"#)
        .expect("valid completed regex")
});

/// One `- ...` entry under the `tasks:` header, with enough line bookkeeping
/// to edit the file surgically.
#[derive(Debug)]
struct TaskBlock {
    title: Option<String>,
    completed: bool,
    parallel_group: u64,
    /// 0-indexed line holding the `title` (dash line when inline).
    title_line: Option<usize>,
    /// 0-indexed line holding the `completed` property, if present.
    completed_line: Option<usize>,
    /// Leading whitespace for a property line inserted into this block.
    insert_indent: String,
    saw_own_line_prop: bool,
}

/// Structured YAML backlog back-end.
///
/// Deliberately not a YAML parser: the file is walked line by line so that a
/// completion edit can preserve indentation, unknown properties and trailing
/// comments byte-for-byte everywhere except the one line it changes.
pub struct YamlSource {
    path: PathBuf,
}

impl YamlSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read task file: {}", self.path.display()))
    }

    fn tasks_from(&self, content: &str) -> Result<Vec<Task>> {
        let blocks = parse_blocks(content)?;
        Ok(blocks
            .into_iter()
            .filter_map(|b| {
                let title = b.title?;
                Some(Task {
                    source: TaskSourceKind::Yaml,
                    text: title,
                    line: b.title_line.map(|l| l + 1),
                    url: None,
                    number: None,
                    group: Some(b.parallel_group),
                    completed: b.completed,
                })
            })
            .collect())
    }
}

impl TaskSource for YamlSource {
    fn kind(&self) -> TaskSourceKind {
        TaskSourceKind::Yaml
    }

    fn next(&self) -> NextOutcome {
        let tasks = match self.read().and_then(|c| self.tasks_from(&c)) {
            Ok(tasks) => tasks,
            Err(err) => {
                return NextOutcome::Error {
                    source: TaskSourceKind::Yaml,
                    message: err.to_string(),
                };
            }
        };

        match tasks.into_iter().find(|t| !t.completed) {
            Some(task) => NextOutcome::Ok { task },
            None => NextOutcome::Empty {
                source: TaskSourceKind::Yaml,
            },
        }
    }

    fn complete(&self, title: &str) -> CompleteOutcome {
        let target = title.trim();
        let content = match self.read() {
            Ok(content) => content,
            Err(err) => {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Yaml,
                    message: err.to_string(),
                };
            }
        };

        let blocks = match parse_blocks(&content) {
            Ok(blocks) => blocks,
            Err(err) => {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Yaml,
                    message: err.to_string(),
                };
            }
        };

        let Some(block) = blocks
            .iter()
            .find(|b| b.title.as_deref().map(str::trim) == Some(target))
        else {
            return CompleteOutcome::NotFound {
                source: TaskSourceKind::Yaml,
                task: target.to_string(),
            };
        };

        if block.completed {
            return CompleteOutcome::AlreadyComplete {
                source: TaskSourceKind::Yaml,
                task: target.to_string(),
            };
        }

        let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();

        if let Some(idx) = block.completed_line {
            // Rewrite the value in place, keeping any trailing comment.
            let Some(caps) = COMPLETED_LINE_RE.captures(&lines[idx]) else {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Yaml,
                    message: format!("Malformed completed line {} in {}", idx + 1, self.path.display()),
                };
            };
            let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let rest = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            lines[idx] = format!("{}true{}", prefix, rest);
        } else {
            let Some(title_idx) = block.title_line else {
                return CompleteOutcome::Error {
                    source: TaskSourceKind::Yaml,
                    message: "Task block has no title line".to_string(),
                };
            };
            lines.insert(title_idx + 1, format!("{}completed: true", block.insert_indent));
        }

        if let Err(err) = fs::write(&self.path, lines.join("\n")) {
            return CompleteOutcome::Error {
                source: TaskSourceKind::Yaml,
                message: format!("Failed to write task file {}: {}", self.path.display(), err),
            };
        }

        debug!(task = target, "yaml:task completed");
        CompleteOutcome::Updated {
            source: TaskSourceKind::Yaml,
            task: target.to_string(),
        }
    }

    fn list(&self) -> Result<Vec<Task>> {
        self.tasks_from(&self.read()?)
    }
}

fn parse_blocks(content: &str) -> Result<Vec<TaskBlock>> {
    let lines: Vec<&str> = content.split('\n').collect();

    let (header_idx, header_indent) = lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| {
            TASKS_HEADER_RE
                .captures(line)
                .map(|caps| (idx, caps.get(1).map(|m| m.as_str().len()).unwrap_or(0)))
        })
        .ok_or_else(|| anyhow!("No 'tasks:' section found"))?;

    let mut blocks: Vec<TaskBlock> = Vec::new();
    let mut current: Option<(usize, TaskBlock)> = None; // (dash indent, block)

    for idx in header_idx + 1..lines.len() {
        let line = lines[idx];
        if line.trim().is_empty() {
            continue;
        }

        let indent = indent_width(line);
        if indent <= header_indent {
            break;
        }

        if let Some(caps) = DASH_RE.captures(line) {
            if let Some((_, block)) = current.take() {
                blocks.push(block);
            }

            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let prefix_len = line.len() - rest.len();
            // Inserted properties line up with the content after "- ".
            let insert_indent: String = line[..prefix_len]
                .chars()
                .map(|c| if c == '-' { ' ' } else { c })
                .collect();

            let mut block = TaskBlock {
                title: None,
                completed: false,
                parallel_group: 0,
                title_line: None,
                completed_line: None,
                insert_indent,
                saw_own_line_prop: false,
            };
            apply_inline(&mut block, rest, idx);
            current = Some((indent, block));
        } else if current.as_ref().is_some_and(|(dash, _)| indent > *dash) {
            let Some((_, block)) = current.as_mut() else {
                continue;
            };
            let trimmed = line.trim_start();
            if let Some(caps) = PROP_RE.captures(trimmed) {
                let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                if !block.saw_own_line_prop {
                    block.saw_own_line_prop = true;
                    block.insert_indent = line[..line.len() - trimmed.len()].to_string();
                }
                apply_property(block, key, value, idx);
            }
        } else if let Some((_, done)) = current.take() {
            // A shallower non-list line closes the open block.
            blocks.push(done);
        }
    }

    if let Some((_, block)) = current.take() {
        blocks.push(block);
    }

    Ok(blocks)
}

// The text after "- " is either an inline `key: value` property or a bare title.
fn apply_inline(block: &mut TaskBlock, rest: &str, line_idx: usize) {
    if let Some(caps) = PROP_RE.captures(rest) {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        apply_property(block, key, value, line_idx);
    } else {
        block.title = Some(strip_quotes(rest.trim()).to_string());
        block.title_line = Some(line_idx);
    }
}

fn apply_property(block: &mut TaskBlock, key: &str, value: &str, line_idx: usize) {
    match key {
        "title" => {
            block.title = Some(strip_quotes(value.trim()).to_string());
            block.title_line = Some(line_idx);
        }
        "completed" => {
            block.completed = scalar_value(value) == "true";
            block.completed_line = Some(line_idx);
        }
        "parallel_group" => {
            block.parallel_group = scalar_value(value).parse().unwrap_or(0);
        }
        _ => {}
    }
}

/// First scalar token of a property value, with quotes stripped and any
/// trailing comment dropped.
fn scalar_value(value: &str) -> String {
    let no_comment = match value.find('#') {
        Some(pos) => &value[..pos],
        None => value,
    };
    strip_quotes(no_comment.trim()).to_string()
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASIC: &str = "\
name: demo
tasks:
  - title: First task
    completed: true
  - title: Second task
  - title: Third task
    parallel_group: 2
";

    fn source_with(content: &str) -> (TempDir, YamlSource) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("tasks.yaml");
        fs::write(&path, content).expect("write task file");
        (dir, YamlSource::new(path))
    }

    #[test]
    fn parse_reads_titles_groups_and_completion() {
        let (_dir, source) = source_with(BASIC);
        let tasks = source.list().expect("list succeeds");

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].text, "First task");
        assert!(tasks[0].completed);
        assert_eq!(tasks[0].group, Some(0));
        assert_eq!(tasks[1].text, "Second task");
        assert!(!tasks[1].completed);
        assert_eq!(tasks[2].group, Some(2));
    }

    #[test]
    fn next_returns_first_incomplete() {
        let (_dir, source) = source_with(BASIC);
        match source.next() {
            NextOutcome::Ok { task } => assert_eq!(task.text, "Second task"),
            other => panic!("expected ok, got {:?}", other),
        }
    }

    #[test]
    fn complete_inserts_after_title_line() {
        let (dir, source) = source_with(BASIC);
        assert!(matches!(
            source.complete("Second task"),
            CompleteOutcome::Updated { .. }
        ));

        let content = fs::read_to_string(dir.path().join("tasks.yaml")).unwrap();
        let expected = "\
name: demo
tasks:
  - title: First task
    completed: true
  - title: Second task
    completed: true
  - title: Third task
    parallel_group: 2
";
        assert_eq!(content, expected);
    }

    #[test]
    fn complete_rewrites_existing_flag_preserving_comment() {
        let (dir, source) = source_with(
            "tasks:\n  - title: Alpha\n    completed: false # pending review\n",
        );
        source.complete("Alpha");

        let content = fs::read_to_string(dir.path().join("tasks.yaml")).unwrap();
        assert_eq!(
            content,
            "tasks:\n  - title: Alpha\n    completed: true # pending review\n"
        );
    }

    #[test]
    fn complete_preserves_parallel_group_property() {
        let (dir, source) = source_with(
            "tasks:\n  - title: Grouped\n    parallel_group: 3\n",
        );
        source.complete("Grouped");

        let content = fs::read_to_string(dir.path().join("tasks.yaml")).unwrap();
        assert_eq!(
            content,
            "tasks:\n  - title: Grouped\n    parallel_group: 3\n    completed: true\n"
        );
    }

    #[test]
    fn complete_is_idempotent() {
        let (_dir, source) = source_with("tasks:\n  - title: Once\n");
        assert!(matches!(
            source.complete("Once"),
            CompleteOutcome::Updated { .. }
        ));
        assert!(matches!(
            source.complete("Once"),
            CompleteOutcome::AlreadyComplete { .. }
        ));
    }

    #[test]
    fn complete_unknown_is_not_found() {
        let (_dir, source) = source_with("tasks:\n  - title: Once\n");
        assert!(matches!(
            source.complete("Never"),
            CompleteOutcome::NotFound { .. }
        ));
    }

    #[test]
    fn quoted_titles_are_stripped() {
        let (_dir, source) = source_with(
            "tasks:\n  - title: \"Quoted title\"\n  - title: 'Single quoted'\n",
        );
        let tasks = source.list().expect("list succeeds");
        assert_eq!(tasks[0].text, "Quoted title");
        assert_eq!(tasks[1].text, "Single quoted");
    }

    #[test]
    fn walk_stops_at_header_indentation() {
        let (_dir, source) = source_with(
            "tasks:\n  - title: Inside\nother:\n  - title: Outside\n",
        );
        let tasks = source.list().expect("list succeeds");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].text, "Inside");
    }

    #[test]
    fn blank_lines_between_blocks_are_tolerated() {
        let (_dir, source) = source_with(
            "tasks:\n  - title: One\n\n  - title: Two\n",
        );
        let tasks = source.list().expect("list succeeds");
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn bare_list_items_are_titles() {
        let (dir, source) = source_with("tasks:\n  - Plain entry\n");
        let tasks = source.list().expect("list succeeds");
        assert_eq!(tasks[0].text, "Plain entry");

        source.complete("Plain entry");
        let content = fs::read_to_string(dir.path().join("tasks.yaml")).unwrap();
        assert_eq!(content, "tasks:\n  - Plain entry\n    completed: true\n");
    }

    #[test]
    fn missing_header_is_an_error() {
        let (_dir, source) = source_with("items:\n  - title: X\n");
        assert!(source.list().is_err());
        assert!(matches!(source.next(), NextOutcome::Error { .. }));
    }
}
