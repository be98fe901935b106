use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::prompt::{self, PromptInput, PromptMode};
use crate::task::TaskSourceKind;

use super::output::{Usage, parse_agent_output};
use super::{AgentRequest, AgentRunner, Engine};

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Options for executing one task through the agent.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub engine: Engine,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_commit: bool,
    pub dry_run: bool,
    pub max_retries: usize,
    pub retry_delay_secs: u64,
    pub prompt_mode: PromptMode,
    pub task_source: Option<TaskSourceKind>,
    pub task_source_path: Option<String>,
    pub issue_body: Option<String>,
    pub workdir: PathBuf,
    pub config: Config,
}

impl ExecOptions {
    pub fn new(workdir: PathBuf, config: Config) -> Self {
        Self {
            engine: Engine::default(),
            skip_tests: false,
            skip_lint: false,
            auto_commit: true,
            dry_run: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            prompt_mode: PromptMode::default(),
            task_source: None,
            task_source_path: None,
            issue_body: None,
            workdir,
            config,
        }
    }
}

/// Result of one task execution. Exactly one of ok / dry-run / error.
#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum ExecOutcome {
    #[serde(rename = "ok", rename_all = "camelCase")]
    Ok {
        engine: Engine,
        attempts: usize,
        response: String,
        usage: Usage,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    #[serde(rename = "dry-run", rename_all = "camelCase")]
    DryRun { engine: Engine, prompt: String },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        engine: Engine,
        attempts: usize,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

/// Execute one task: build the prompt, invoke the agent with bounded
/// retries, parse and classify its output.
///
/// A dry run returns the composed prompt and has no side effects: no files
/// are written and no agent is spawned.
pub fn execute_task(task: &str, opts: &ExecOptions, agent: &dyn AgentRunner) -> ExecOutcome {
    let prompt_input = PromptInput {
        task,
        mode: opts.prompt_mode,
        source: opts.task_source,
        source_path: opts.task_source_path.as_deref(),
        issue_body: opts.issue_body.as_deref(),
        skip_tests: opts.skip_tests,
        skip_lint: opts.skip_lint,
        auto_commit: opts.auto_commit,
        config: &opts.config,
    };
    let prompt = match prompt::compose(&prompt_input) {
        Ok(prompt) => prompt,
        Err(err) => {
            return ExecOutcome::Error {
                engine: opts.engine,
                attempts: 0,
                error: err.to_string(),
                stdout: None,
                stderr: None,
                exit_code: None,
            };
        }
    };

    if opts.dry_run {
        debug!(engine = %opts.engine, "executor:dry run");
        return ExecOutcome::DryRun {
            engine: opts.engine,
            prompt,
        };
    }

    let max_retries = opts.max_retries.max(1);
    let mut attempts = 0;
    let mut last_error = String::from("Agent was never invoked");
    let mut last_output: Option<(String, String, i32)> = None;

    while attempts < max_retries {
        attempts += 1;
        info!(engine = %opts.engine, attempt = attempts, max = max_retries, "executor:attempt");

        // Codex writes its final message to a file; give each attempt a
        // fresh scratch dir, removed when the attempt ends either way.
        let scratch = if opts.engine == Engine::Codex {
            match TempDir::new() {
                Ok(dir) => Some(dir),
                Err(err) => {
                    last_error = format!("Failed to create scratch directory: {}", err);
                    last_output = None;
                    sleep_before_retry(opts, attempts, max_retries);
                    continue;
                }
            }
        } else {
            None
        };
        let last_message_path = scratch.as_ref().map(|dir| dir.path().join("last-message.txt"));

        let request = AgentRequest {
            engine: opts.engine,
            prompt: &prompt,
            workdir: &opts.workdir,
            env: &[],
            last_message_path: last_message_path.as_deref(),
        };

        let invocation = match agent.invoke(&request) {
            Ok(invocation) => {
                debug!(command = %invocation.command, exit_code = invocation.exit_code, "executor:agent returned");
                invocation
            }
            Err(err) => {
                warn!(engine = %opts.engine, attempt = attempts, error = %err, "executor:spawn failed");
                last_error = err.to_string();
                last_output = None;
                sleep_before_retry(opts, attempts, max_retries);
                continue;
            }
        };

        let parsed =
            parse_agent_output(opts.engine, &invocation.stdout, last_message_path.as_deref());

        let failure = if let Some(message) = parsed.error {
            Some(message)
        } else if invocation.exit_code != 0 {
            Some(format!("Agent exited with code {}", invocation.exit_code))
        } else if parsed.response.is_empty() {
            Some("Empty response from agent".to_string())
        } else {
            None
        };

        match failure {
            None => {
                info!(engine = %opts.engine, attempts, "executor:success");
                return ExecOutcome::Ok {
                    engine: opts.engine,
                    attempts,
                    response: parsed.response,
                    usage: parsed.usage,
                    stdout: invocation.stdout,
                    stderr: invocation.stderr,
                    exit_code: invocation.exit_code,
                };
            }
            Some(message) => {
                warn!(engine = %opts.engine, attempt = attempts, error = %message, "executor:attempt failed");
                last_error = message;
                last_output = Some((invocation.stdout, invocation.stderr, invocation.exit_code));
                sleep_before_retry(opts, attempts, max_retries);
            }
        }
    }

    let (stdout, stderr, exit_code) = match last_output {
        Some((stdout, stderr, exit_code)) => (Some(stdout), Some(stderr), Some(exit_code)),
        None => (None, None, None),
    };
    ExecOutcome::Error {
        engine: opts.engine,
        attempts,
        error: last_error,
        stdout,
        stderr,
        exit_code,
    }
}

// Flat delay, elapsed wall time; no backoff.
fn sleep_before_retry(opts: &ExecOptions, attempts: usize, max_retries: usize) {
    if attempts < max_retries && opts.retry_delay_secs > 0 {
        debug!(delay_secs = opts.retry_delay_secs, "executor:retry delay");
        std::thread::sleep(Duration::from_secs(opts.retry_delay_secs));
    }
}
