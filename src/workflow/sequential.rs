use std::path::Path;

use tracing::{info, warn};

use crate::agent::executor::{ExecOptions, ExecOutcome, execute_task};
use crate::agent::output::Usage;
use crate::config::Config;
use crate::git;
use crate::git::branch::BranchManager;
use crate::pr::PrRequest;
use crate::prompt::PromptMode;
use crate::task::{self, CompleteOutcome, NextOutcome, TaskSource};

use super::RunDeps;
use super::preflight;
use super::progress;
use super::types::{
    PrdOptions, PrdOutcome, PrdReport, RunStatus, Stage, StopReason, TaskRun, TaskRunStatus,
};

/// Run the PRD backlog sequentially: next-task, execute, complete, optional
/// branch/PR, repeat. Stops at the first stage error and returns the
/// accumulated state.
pub fn run(cwd: &Path, opts: &PrdOptions, deps: &RunDeps) -> PrdOutcome {
    let failures = preflight::check_requirements(cwd, &opts.source);
    if !failures.is_empty() {
        return PrdOutcome::preflight(failures);
    }

    // Zero iterations means no work, resolved before any setup.
    if opts.max_iterations == Some(0) {
        return PrdOutcome::Report(PrdReport::empty_ok(StopReason::MaxIterations));
    }

    let config = match Config::load(cwd) {
        Ok(config) => config,
        Err(err) => return PrdOutcome::preflight(vec![err.to_string()]),
    };

    let selected;
    let source: &dyn TaskSource = match &deps.source {
        Some(source) => source.as_ref(),
        None => {
            selected = task::select_source(&opts.source, cwd, deps.gh.clone());
            selected.as_ref()
        }
    };

    let mut branch_mgr = if opts.branch_per_task {
        let mut mgr = BranchManager::new(
            deps.git.clone(),
            cwd.to_path_buf(),
            opts.base_branch.clone(),
        );
        if let Err(err) = mgr.prepare() {
            return PrdOutcome::preflight(vec![format!("Branch setup failed: {}", err)]);
        }
        Some(mgr)
    } else {
        None
    };

    let report = run_loop(cwd, opts, deps, &config, source, &mut branch_mgr);

    // Restore the original branch and stash on every exit path.
    if let Some(mgr) = branch_mgr.as_mut()
        && let Err(err) = mgr.cleanup()
    {
        warn!(error = %err, "prd:branch cleanup failed");
    }

    PrdOutcome::Report(report)
}

struct LoopState {
    iterations: usize,
    completed: usize,
    tasks: Vec<TaskRun>,
    usage: Usage,
}

impl LoopState {
    fn ok(self, stopped: StopReason) -> PrdReport {
        PrdReport {
            status: RunStatus::Ok,
            stopped: Some(stopped),
            stage: None,
            message: None,
            task: None,
            iterations: self.iterations,
            completed: self.completed,
            tasks: self.tasks,
            usage: self.usage,
        }
    }

    fn error(self, stage: Stage, message: impl Into<String>, task: Option<String>) -> PrdReport {
        PrdReport {
            status: RunStatus::Error,
            stopped: None,
            stage: Some(stage),
            message: Some(message.into()),
            task,
            iterations: self.iterations,
            completed: self.completed,
            tasks: self.tasks,
            usage: self.usage,
        }
    }
}

fn run_loop(
    cwd: &Path,
    opts: &PrdOptions,
    deps: &RunDeps,
    config: &Config,
    source: &dyn TaskSource,
    branch_mgr: &mut Option<BranchManager>,
) -> PrdReport {
    let mut state = LoopState {
        iterations: 0,
        completed: 0,
        tasks: Vec::new(),
        usage: Usage::default(),
    };
    let source_path_hint = opts
        .source
        .file_path(cwd)
        .map(|p| p.to_string_lossy().into_owned());

    loop {
        if let Some(max) = opts.max_iterations
            && state.iterations >= max
        {
            info!(iterations = state.iterations, "prd:max iterations reached");
            return state.ok(StopReason::MaxIterations);
        }

        let task = match source.next() {
            NextOutcome::Ok { task } => task,
            NextOutcome::Empty { .. } => {
                info!(completed = state.completed, "prd:backlog drained");
                return state.ok(StopReason::NoTasks);
            }
            NextOutcome::Error { message, .. } => {
                return state.error(Stage::TaskSource, message, None);
            }
        };
        state.iterations += 1;
        info!(iteration = state.iterations, task = %task.text, "prd:task start");

        let task_branch = match branch_mgr.as_ref() {
            Some(mgr) => match mgr.checkout_for_task(&task.text) {
                Ok(branch) => Some(branch),
                Err(err) => {
                    return state.error(
                        Stage::Agent,
                        format!("Branch creation failed: {}", err),
                        Some(task.text),
                    );
                }
            },
            None => None,
        };

        let exec_opts = ExecOptions {
            engine: opts.engine,
            skip_tests: opts.skip_tests,
            skip_lint: opts.skip_lint,
            auto_commit: opts.auto_commit,
            dry_run: opts.dry_run,
            max_retries: opts.max_retries,
            retry_delay_secs: opts.retry_delay,
            prompt_mode: PromptMode::Prd,
            task_source: Some(task.source),
            task_source_path: source_path_hint.clone(),
            issue_body: None,
            workdir: cwd.to_path_buf(),
            config: config.clone(),
        };
        let outcome = execute_task(&task.text, &exec_opts, deps.agent.as_ref());

        // Back to the base branch regardless of how the attempt went.
        if let Some(mgr) = branch_mgr.as_ref()
            && let Err(err) = mgr.finish_task()
        {
            warn!(error = %err, "prd:finish-task checkout failed");
        }

        match outcome {
            ExecOutcome::Ok {
                attempts,
                response,
                usage,
                ..
            } => {
                state.usage.add(&usage);
                progress::record(cwd, true, &task.text);
                state.tasks.push(TaskRun {
                    task: task.text.clone(),
                    source: task.source,
                    status: TaskRunStatus::Completed,
                    attempts,
                    response: Some(response.clone()),
                    error: None,
                });
                state.completed += 1;

                match source.complete(&task.text) {
                    CompleteOutcome::Updated { .. } | CompleteOutcome::AlreadyComplete { .. } => {
                        if (opts.create_pr || opts.draft_pr)
                            && let Err(report) = open_pr(
                                cwd,
                                opts,
                                deps,
                                &task.text,
                                &response,
                                task_branch.as_deref(),
                                branch_mgr.as_ref(),
                            )
                        {
                            return state.error(Stage::Pr, report, Some(task.text));
                        }
                    }
                    CompleteOutcome::NotFound { .. } => {
                        return state.error(
                            Stage::Complete,
                            "Task not found in source",
                            Some(task.text),
                        );
                    }
                    CompleteOutcome::Error { message, .. } => {
                        return state.error(Stage::Complete, message, Some(task.text));
                    }
                }
            }
            ExecOutcome::DryRun { .. } => {
                let message = "Dry run not supported for PRD execution";
                progress::record(cwd, false, &task.text);
                state.tasks.push(TaskRun {
                    task: task.text.clone(),
                    source: task.source,
                    status: TaskRunStatus::Failed,
                    attempts: 0,
                    response: None,
                    error: Some(message.to_string()),
                });
                return state.error(Stage::Agent, message, Some(task.text));
            }
            ExecOutcome::Error {
                attempts, error, ..
            } => {
                progress::record(cwd, false, &task.text);
                state.tasks.push(TaskRun {
                    task: task.text.clone(),
                    source: task.source,
                    status: TaskRunStatus::Failed,
                    attempts,
                    response: None,
                    error: Some(error.clone()),
                });
                return state.error(Stage::Agent, error, Some(task.text));
            }
        }
    }
}

fn open_pr(
    cwd: &Path,
    opts: &PrdOptions,
    deps: &RunDeps,
    task: &str,
    response: &str,
    task_branch: Option<&str>,
    branch_mgr: Option<&BranchManager>,
) -> Result<(), String> {
    let base = match branch_mgr.and_then(|m| m.base_branch()) {
        Some(base) => base.to_string(),
        None => git::current_branch(deps.git.as_ref(), cwd).map_err(|e| e.to_string())?,
    };
    let head = task_branch.unwrap_or(base.as_str());

    let request = PrRequest {
        title: task,
        body: response,
        base: &base,
        head,
        draft: opts.draft_pr,
    };
    deps.pr
        .create(cwd, &request)
        .map(|_| ())
        .map_err(|e| e.to_string())
}
