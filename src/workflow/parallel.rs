use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::agent::executor::{ExecOptions, ExecOutcome, execute_task};
use crate::agent::output::Usage;
use crate::cmd::CommandRunner;
use crate::config::Config;
use crate::git;
use crate::git::worktree::{CleanupOptions, WorktreeManager};
use crate::naming;
use crate::prompt::PromptMode;
use crate::task::markdown::MarkdownSource;
use crate::task::yaml::YamlSource;
use crate::task::{CompleteOutcome, Task, TaskSource, TaskSourceKind};

use super::RunDeps;
use super::preflight;
use super::resolve;
use super::signals::SignalGuard;
use super::types::{
    PrdOptions, PrdOutcome, PrdReport, RunStatus, Stage, StopReason, TaskRun, TaskRunStatus,
};

/// Parallel mode only supports the file-backed sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Markdown,
    Yaml,
}

impl FileKind {
    fn source(self, path: PathBuf) -> Box<dyn TaskSource> {
        match self {
            FileKind::Markdown => Box::new(MarkdownSource::new(path)),
            FileKind::Yaml => Box::new(YamlSource::new(path)),
        }
    }

    fn kind(self) -> TaskSourceKind {
        match self {
            FileKind::Markdown => TaskSourceKind::Markdown,
            FileKind::Yaml => TaskSourceKind::Yaml,
        }
    }
}

/// Tasks of one parallel group, with their original indices.
struct GroupJob {
    key: String,
    tasks: Vec<(usize, Task)>,
}

/// What a worker hands to the serialization point for one finished group.
struct GroupResult {
    key: String,
    branch: Option<String>,
    runs: Vec<(usize, TaskRun)>,
    usage: Usage,
    error: Option<(Stage, String, Option<String>)>,
    /// Acknowledged once the serialization point has integrated the result;
    /// the worker waits for it before pulling the next group, so the advanced
    /// base branch is visible to its next allocation.
    done: mpsc::Sender<()>,
}

struct WorkerCtx<'a> {
    kind: FileKind,
    source_file: &'a Path,
    config: &'a Config,
    opts: &'a PrdOptions,
    manager: &'a Mutex<WorktreeManager>,
    current_base: &'a Mutex<String>,
    agent: &'a dyn AgentRunner,
}

/// Run the backlog in parallel: partition tasks into dependency groups, fan
/// out bounded workers across isolated worktrees, serially promote finished
/// groups into chained integration branches, and finally merge back to the
/// original base.
pub fn run(cwd: &Path, opts: &PrdOptions, deps: &RunDeps) -> PrdOutcome {
    if opts.branch_per_task || opts.create_pr || opts.draft_pr {
        return PrdOutcome::Report(PrdReport::stage_error(
            Stage::Pr,
            "Parallel mode cannot be combined with branch-per-task or PR creation",
            None,
        ));
    }
    if opts.source.kind() == TaskSourceKind::Github {
        return PrdOutcome::Report(PrdReport::stage_error(
            Stage::TaskSource,
            "Parallel mode requires a Markdown or YAML task source",
            None,
        ));
    }

    let failures = preflight::check_requirements(cwd, &opts.source);
    if !failures.is_empty() {
        return PrdOutcome::preflight(failures);
    }
    if opts.max_iterations == Some(0) {
        return PrdOutcome::Report(PrdReport::empty_ok(StopReason::MaxIterations));
    }

    let config = match Config::load(cwd) {
        Ok(config) => config,
        Err(err) => return PrdOutcome::preflight(vec![err.to_string()]),
    };

    let kind = match opts.source.kind() {
        TaskSourceKind::Yaml => FileKind::Yaml,
        _ => FileKind::Markdown,
    };
    let Some(source_file) = opts.source.file_path(cwd) else {
        return PrdOutcome::Report(PrdReport::stage_error(
            Stage::TaskSource,
            "Parallel mode requires a file-based task source",
            None,
        ));
    };

    // Parse the task source exactly once.
    let all_tasks = match kind.source(source_file.clone()).list() {
        Ok(tasks) => tasks,
        Err(err) => {
            return PrdOutcome::Report(PrdReport::stage_error(
                Stage::TaskSource,
                err.to_string(),
                None,
            ));
        }
    };

    let mut pending: Vec<(usize, Task)> = all_tasks
        .into_iter()
        .filter(|t| !t.completed)
        .enumerate()
        .collect();
    let total_pending = pending.len();
    if let Some(max) = opts.max_iterations {
        pending.truncate(max);
    }
    let truncated = pending.len() < total_pending;
    if pending.is_empty() {
        return PrdOutcome::Report(PrdReport::empty_ok(StopReason::NoTasks));
    }

    // Partition into groups, preserving first-seen order.
    let mut groups: Vec<GroupJob> = Vec::new();
    for (idx, task) in pending {
        let key = match kind {
            FileKind::Markdown => "default".to_string(),
            FileKind::Yaml => task.group.unwrap_or(0).to_string(),
        };
        match groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.tasks.push((idx, task)),
            None => groups.push(GroupJob {
                key,
                tasks: vec![(idx, task)],
            }),
        }
    }
    let group_count = groups.len();
    let worker_count = opts.max_parallel.unwrap_or(group_count).clamp(1, group_count);
    let integrate_groups = kind == FileKind::Yaml && group_count > 1;
    info!(groups = group_count, workers = worker_count, "parallel:start");

    let original_base = match git::current_branch(deps.git.as_ref(), cwd) {
        Ok(branch) => branch,
        Err(err) => {
            return PrdOutcome::Report(PrdReport::stage_error(Stage::Merge, err.to_string(), None));
        }
    };

    let manager = Arc::new(Mutex::new(WorktreeManager::new(
        deps.git.clone(),
        cwd.to_path_buf(),
        None,
        None,
    )));
    let current_base = Mutex::new(original_base.clone());
    let queue: Mutex<VecDeque<GroupJob>> = Mutex::new(VecDeque::from(groups));
    let guard = SignalGuard::arm(manager.clone());

    let ctx = WorkerCtx {
        kind,
        source_file: &source_file,
        config: &config,
        opts,
        manager: &*manager,
        current_base: &current_base,
        agent: deps.agent.as_ref(),
    };

    // Single-slot handoff: the worker blocks until the serialization point
    // has consumed (and integrated) its result.
    let (tx, rx) = mpsc::sync_channel::<GroupResult>(1);

    let mut all_runs: Vec<(usize, TaskRun)> = Vec::new();
    let mut total_usage = Usage::default();
    let mut first_error: Option<(Stage, String, Option<String>)> = None;
    let mut parallel_branches: Vec<String> = Vec::new();
    let mut integration_branches: Vec<String> = Vec::new();

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let tx = tx.clone();
            let ctx = &ctx;
            let queue = &queue;
            scope.spawn(move || {
                loop {
                    let job = queue.lock().unwrap().pop_front();
                    let Some(job) = job else { break };

                    let (done_tx, done_rx) = mpsc::channel();
                    let result = run_group(job, ctx, done_tx);
                    if tx.send(result).is_err() {
                        break;
                    }
                    // Wait until integration advanced the base branch.
                    let _ = done_rx.recv();
                }
            });
        }
        drop(tx);

        // Serialization point: the only place shared run state is mutated.
        for result in rx.iter() {
            all_runs.extend(result.runs);
            total_usage.add(&result.usage);

            if let Some(error) = result.error {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            } else if let Some(branch) = result.branch {
                parallel_branches.push(branch.clone());
                if integrate_groups && first_error.is_none() {
                    match promote_group(deps.git.as_ref(), cwd, &result.key, &branch, &current_base)
                    {
                        Ok(integration) => {
                            *current_base.lock().unwrap() = integration.clone();
                            integration_branches.push(integration);
                        }
                        Err(message) => first_error = Some((Stage::Merge, message, None)),
                    }
                }
            }
            let _ = result.done.send(());
        }
    });

    guard.disarm();

    // Remove worktrees before touching branches; a branch checked out in a
    // live worktree cannot be deleted or cleanly merged around.
    {
        let mut manager = manager.lock().unwrap();
        info!(worktrees = manager.records().len(), "parallel:cleanup");
        if let Err(err) = manager.cleanup(&CleanupOptions {
            remove_branches: false,
            preserve_dirty: false,
        }) {
            warn!(error = %err, "parallel:worktree cleanup failed");
        }
    }

    if let Some((stage, message, task)) = first_error {
        return PrdOutcome::Report(build_report(
            all_runs,
            total_usage,
            RunStatus::Error,
            None,
            Some(stage),
            Some(message),
            task,
        ));
    }

    if let Err(err) = finalize(
        cwd,
        opts,
        deps,
        &original_base,
        &parallel_branches,
        &integration_branches,
    ) {
        return PrdOutcome::Report(build_report(
            all_runs,
            total_usage,
            RunStatus::Error,
            None,
            Some(Stage::Merge),
            Some(err),
            None,
        ));
    }

    let stopped = if truncated {
        StopReason::MaxIterations
    } else {
        StopReason::NoTasks
    };
    PrdOutcome::Report(build_report(
        all_runs,
        total_usage,
        RunStatus::Ok,
        Some(stopped),
        None,
        None,
        None,
    ))
}

/// Execute one group's tasks serially inside a fresh worktree, completing
/// each against the worktree's copy of the task source.
fn run_group(job: GroupJob, ctx: &WorkerCtx<'_>, done: mpsc::Sender<()>) -> GroupResult {
    let first_task = job.tasks.first().map(|(_, t)| t.text.clone());

    let base = ctx.current_base.lock().unwrap().clone();
    let record = match ctx.manager.lock().unwrap().allocate(
        &job.key,
        Some(&base),
        Some(ctx.source_file),
    ) {
        Ok(record) => record,
        Err(err) => {
            return GroupResult {
                key: job.key,
                branch: None,
                runs: Vec::new(),
                usage: Usage::default(),
                error: Some((Stage::Agent, err.to_string(), first_task)),
                done,
            };
        }
    };
    info!(group = %job.key, branch = %record.branch, "parallel:group start");

    let copied = record
        .copied_task_source
        .clone()
        .unwrap_or_else(|| record.path.join(ctx.source_file.file_name().unwrap_or_default()));
    let worktree_source = ctx.kind.source(copied.clone());

    let mut runs: Vec<(usize, TaskRun)> = Vec::new();
    let mut usage = Usage::default();
    let mut error: Option<(Stage, String, Option<String>)> = None;

    for (idx, task) in &job.tasks {
        let exec_opts = ExecOptions {
            engine: ctx.opts.engine,
            skip_tests: ctx.opts.skip_tests,
            skip_lint: ctx.opts.skip_lint,
            auto_commit: ctx.opts.auto_commit,
            dry_run: ctx.opts.dry_run,
            max_retries: ctx.opts.max_retries,
            retry_delay_secs: ctx.opts.retry_delay,
            prompt_mode: PromptMode::Prd,
            task_source: Some(ctx.kind.kind()),
            task_source_path: Some(copied.to_string_lossy().into_owned()),
            issue_body: None,
            workdir: record.path.clone(),
            config: ctx.config.clone(),
        };

        match execute_task(&task.text, &exec_opts, ctx.agent) {
            ExecOutcome::Ok {
                attempts,
                response,
                usage: task_usage,
                ..
            } => {
                usage.add(&task_usage);
                runs.push((
                    *idx,
                    TaskRun {
                        task: task.text.clone(),
                        source: task.source,
                        status: TaskRunStatus::Completed,
                        attempts,
                        response: Some(response),
                        error: None,
                    },
                ));
                match worktree_source.complete(&task.text) {
                    CompleteOutcome::Updated { .. } | CompleteOutcome::AlreadyComplete { .. } => {}
                    CompleteOutcome::NotFound { .. } => {
                        error = Some((
                            Stage::Complete,
                            "Task not found in source".to_string(),
                            Some(task.text.clone()),
                        ));
                        break;
                    }
                    CompleteOutcome::Error { message, .. } => {
                        error = Some((Stage::Complete, message, Some(task.text.clone())));
                        break;
                    }
                }
            }
            ExecOutcome::DryRun { .. } => {
                let message = "Dry run not supported for PRD execution".to_string();
                runs.push((
                    *idx,
                    TaskRun {
                        task: task.text.clone(),
                        source: task.source,
                        status: TaskRunStatus::Failed,
                        attempts: 0,
                        response: None,
                        error: Some(message.clone()),
                    },
                ));
                error = Some((Stage::Agent, message, Some(task.text.clone())));
                break;
            }
            ExecOutcome::Error {
                attempts,
                error: exec_error,
                ..
            } => {
                runs.push((
                    *idx,
                    TaskRun {
                        task: task.text.clone(),
                        source: task.source,
                        status: TaskRunStatus::Failed,
                        attempts,
                        response: None,
                        error: Some(exec_error.clone()),
                    },
                ));
                error = Some((Stage::Agent, exec_error, Some(task.text.clone())));
                break;
            }
        }
    }

    GroupResult {
        key: job.key,
        branch: Some(record.branch),
        runs,
        usage,
        error,
        done,
    }
}

/// Promote a finished group's branch into a fresh integration branch chained
/// off the current base. Runs inside the serialization point.
fn promote_group(
    git_runner: &dyn CommandRunner,
    cwd: &Path,
    group_key: &str,
    branch: &str,
    current_base: &Mutex<String>,
) -> Result<String, String> {
    let base = current_base.lock().unwrap().clone();
    let live = git::list_branches(git_runner, cwd).map_err(|e| e.to_string())?;
    let integration = naming::unique_name(
        &format!("ralphy/integration-group-{}", naming::slug(group_key)),
        &live,
    );

    git::create_branch(git_runner, cwd, &integration, &base).map_err(|e| e.to_string())?;
    let prior = git::current_branch(git_runner, cwd).map_err(|e| e.to_string())?;
    git::checkout(git_runner, cwd, &integration).map_err(|e| e.to_string())?;

    if let Err(err) = git::merge_no_edit(git_runner, cwd, branch) {
        git::abort_merge(git_runner, cwd);
        let _ = git::checkout(git_runner, cwd, &prior);
        let _ = git::delete_branch(git_runner, cwd, &integration, true);
        return Err(err.to_string());
    }

    git::checkout(git_runner, cwd, &prior).map_err(|e| e.to_string())?;
    info!(integration = %integration, base = %base, "parallel:group promoted");
    Ok(integration)
}

/// Merge the completed work back into the original base branch.
fn finalize(
    cwd: &Path,
    opts: &PrdOptions,
    deps: &RunDeps,
    original_base: &str,
    parallel_branches: &[String],
    integration_branches: &[String],
) -> Result<(), String> {
    git::checkout(deps.git.as_ref(), cwd, original_base).map_err(|e| e.to_string())?;

    if let Some(last) = integration_branches.last() {
        // The last integration branch transitively contains all earlier ones.
        git::merge_no_edit(deps.git.as_ref(), cwd, last).map_err(|e| e.to_string())?;
        for branch in integration_branches.iter().chain(parallel_branches) {
            if let Err(err) = git::delete_branch(deps.git.as_ref(), cwd, branch, true) {
                warn!(branch = %branch, error = %err, "parallel:branch delete failed");
            }
        }
        info!(merged = %last, "parallel:final merge complete");
        return Ok(());
    }

    let mut conflicts: Vec<String> = Vec::new();
    for branch in parallel_branches {
        let merged = match git::merge_no_edit(deps.git.as_ref(), cwd, branch) {
            Ok(()) => true,
            Err(_) => resolve::resolve_conflicts(
                cwd,
                opts.engine,
                deps.git.as_ref(),
                deps.agent.as_ref(),
            )
            .is_ok(),
        };
        if merged {
            if let Err(err) = git::delete_branch(deps.git.as_ref(), cwd, branch, false) {
                warn!(branch = %branch, error = %err, "parallel:branch delete failed");
            }
        } else {
            conflicts.push(branch.clone());
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(format!("Merge conflicts remain in: {}", conflicts.join(", ")))
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_report(
    mut runs: Vec<(usize, TaskRun)>,
    usage: Usage,
    status: RunStatus,
    stopped: Option<StopReason>,
    stage: Option<Stage>,
    message: Option<String>,
    task: Option<String>,
) -> PrdReport {
    // Report tasks in source order regardless of completion order.
    runs.sort_by_key(|(idx, _)| *idx);
    let tasks: Vec<TaskRun> = runs.into_iter().map(|(_, run)| run).collect();
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskRunStatus::Completed)
        .count();

    PrdReport {
        status,
        stopped,
        stage,
        message,
        task,
        iterations: tasks.len(),
        completed,
        tasks,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvocation, AgentRequest};
    use crate::cmd::CmdOutput;
    use crate::pr::{PrCreator, PrRequest};
    use anyhow::Result;
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory git covering everything the scheduler shells out for.
    struct FakeGit {
        state: Mutex<GitState>,
        /// Branches whose merge fails while `main` is checked out.
        fail_on_main: HashSet<String>,
        /// What `diff --diff-filter=U` reports after a failed merge.
        conflicted: Vec<String>,
    }

    #[derive(Default)]
    struct GitState {
        current: String,
        branches: Vec<String>,
        branch_bases: HashMap<String, String>,
        merges: Vec<(String, String)>,
        worktree_adds: usize,
        worktree_removes: usize,
        aborts: usize,
    }

    impl FakeGit {
        fn new() -> Self {
            Self {
                state: Mutex::new(GitState {
                    current: "main".into(),
                    branches: vec!["main".into()],
                    ..Default::default()
                }),
                fail_on_main: HashSet::new(),
                conflicted: Vec::new(),
            }
        }

        fn failing_merge(branch: &str, conflicted: &[&str]) -> Self {
            let mut git = Self::new();
            git.fail_on_main.insert(branch.to_string());
            git.conflicted = conflicted.iter().map(|s| s.to_string()).collect();
            git
        }

        fn state(&self) -> std::sync::MutexGuard<'_, GitState> {
            self.state.lock().unwrap()
        }
    }

    impl CommandRunner for FakeGit {
        fn run(&self, _workdir: &Path, args: &[&str]) -> Result<CmdOutput> {
            let mut s = self.state.lock().unwrap();
            let ok = |stdout: &str| CmdOutput {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: 0,
            };
            let fail = |stderr: &str| CmdOutput {
                stdout: String::new(),
                stderr: stderr.into(),
                exit_code: 1,
            };

            let out = match args {
                ["rev-parse", "--abbrev-ref", "HEAD"] => ok(&s.current),
                ["rev-parse", "-q", "--verify", "MERGE_HEAD"] => fail(""),
                ["status", "--porcelain"] => ok(""),
                ["branch", "--format=%(refname:short)"] => ok(&s.branches.join("\n")),
                ["branch", "-D", branch] | ["branch", "-d", branch] => {
                    let branch = branch.to_string();
                    s.branches.retain(|b| *b != branch);
                    ok("")
                }
                ["branch", branch, base] => {
                    s.branches.push(branch.to_string());
                    s.branch_bases.insert(branch.to_string(), base.to_string());
                    ok("")
                }
                ["checkout", branch] => {
                    s.current = branch.to_string();
                    ok("")
                }
                ["worktree", "add", "-b", branch, _path, base] => {
                    s.branches.push(branch.to_string());
                    s.branch_bases.insert(branch.to_string(), base.to_string());
                    s.worktree_adds += 1;
                    ok("")
                }
                ["worktree", "remove", "--force", _path] => {
                    s.worktree_removes += 1;
                    ok("")
                }
                ["merge", "--no-edit", branch] => {
                    if s.current == "main" && self.fail_on_main.contains(*branch) {
                        fail("CONFLICT (content): Merge conflict")
                    } else {
                        let current = s.current.clone();
                        s.merges.push((current, branch.to_string()));
                        ok("")
                    }
                }
                ["merge", "--abort"] => {
                    s.aborts += 1;
                    ok("")
                }
                ["diff", "--name-only", "--diff-filter=U"] => ok(&self.conflicted.join("\n")),
                other => panic!("unexpected git call: {:?}", other),
            };
            Ok(out)
        }
    }

    /// Always-succeeding agent that tracks peak concurrency.
    struct FakeAgent {
        current: AtomicUsize,
        peak: AtomicUsize,
        invocations: AtomicUsize,
    }

    impl FakeAgent {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                invocations: AtomicUsize::new(0),
            }
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    impl AgentRunner for FakeAgent {
        fn invoke(&self, _req: &AgentRequest<'_>) -> Result<AgentInvocation> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.invocations.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentInvocation {
                command: "fake".into(),
                stdout: r#"{"type":"result","result":"done","usage":{"input_tokens":1,"output_tokens":1}}"#.into(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    struct FailingAgent;

    impl AgentRunner for FailingAgent {
        fn invoke(&self, _req: &AgentRequest<'_>) -> Result<AgentInvocation> {
            Ok(AgentInvocation {
                command: "fake".into(),
                stdout: String::new(),
                stderr: "kaboom".into(),
                exit_code: 1,
            })
        }
    }

    struct NoPr;

    impl PrCreator for NoPr {
        fn create(&self, _workdir: &Path, _req: &PrRequest<'_>) -> Result<String> {
            panic!("PR creation must not happen in parallel mode");
        }
    }

    fn workspace_yaml(content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("tasks.yaml"), content).unwrap();
        dir
    }

    fn deps(git: Arc<FakeGit>, agent: Arc<dyn AgentRunner>) -> RunDeps {
        RunDeps {
            git: git.clone(),
            gh: git,
            agent,
            pr: Arc::new(NoPr),
            source: None,
        }
    }

    fn yaml_options(max_parallel: Option<usize>) -> PrdOptions {
        PrdOptions {
            source: crate::task::SourceOptions {
                yaml: Some("tasks.yaml".into()),
                ..Default::default()
            },
            parallel: true,
            max_parallel,
            retry_delay: 0,
            ..Default::default()
        }
    }

    fn report(outcome: PrdOutcome) -> PrdReport {
        match outcome {
            PrdOutcome::Report(report) => report,
            PrdOutcome::Preflight(p) => panic!("unexpected preflight failure: {:?}", p.failures),
        }
    }

    const TWO_GROUPS_FOUR_TASKS: &str = "\
tasks:
  - title: A
    parallel_group: 1
  - title: B
    parallel_group: 1
  - title: C
    parallel_group: 2
  - title: D
    parallel_group: 2
";

    #[test]
    fn serial_parallelism_runs_all_groups() {
        let dir = workspace_yaml(TWO_GROUPS_FOUR_TASKS);
        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git.clone(), agent.clone());

        let report = report(run(dir.path(), &yaml_options(Some(1)), &deps));
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.completed, 4);
        assert_eq!(report.iterations, 4);

        // Source order regardless of completion order.
        let titles: Vec<&str> = report.tasks.iter().map(|t| t.task.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C", "D"]);

        // One worker: no overlapping agent invocations.
        assert_eq!(agent.peak(), 1);
        assert_eq!(agent.invocations(), 4);

        let state = git.state();
        assert_eq!(state.worktree_adds, 2);
        assert_eq!(state.worktree_removes, 2);
    }

    #[test]
    fn usage_is_summed_across_groups() {
        let dir = workspace_yaml(TWO_GROUPS_FOUR_TASKS);
        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git, agent);

        let report = report(run(dir.path(), &yaml_options(Some(2)), &deps));
        assert_eq!(report.usage.input_tokens, 4);
        assert_eq!(report.usage.output_tokens, 4);
    }

    #[test]
    fn integration_branches_chain_off_each_other() {
        let dir = workspace_yaml(
            "tasks:\n  - title: One\n    parallel_group: 1\n  - title: Two\n    parallel_group: 2\n",
        );
        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git.clone(), agent);

        let report = report(run(dir.path(), &yaml_options(Some(1)), &deps));
        assert_eq!(report.status, RunStatus::Ok);

        let state = git.state();
        assert_eq!(
            state.branch_bases.get("ralphy/integration-group-1"),
            Some(&"main".to_string())
        );
        assert_eq!(
            state.branch_bases.get("ralphy/integration-group-2"),
            Some(&"ralphy/integration-group-1".to_string())
        );
        // Parallel branches existed for both groups.
        assert!(state.branch_bases.contains_key("ralphy/parallel/1"));
        assert!(state.branch_bases.contains_key("ralphy/parallel/2"));

        // Only the last integration branch is merged into the original base.
        let into_main: Vec<&str> = state
            .merges
            .iter()
            .filter(|(target, _)| target == "main")
            .map(|(_, b)| b.as_str())
            .collect();
        assert_eq!(into_main, vec!["ralphy/integration-group-2"]);

        // All scheduler branches are deleted on success.
        assert_eq!(state.branches, vec!["main".to_string()]);
    }

    #[test]
    fn final_merge_failure_surfaces_the_command() {
        let dir = workspace_yaml(
            "tasks:\n  - title: One\n    parallel_group: 1\n  - title: Two\n    parallel_group: 2\n",
        );
        let git = Arc::new(FakeGit::failing_merge("ralphy/integration-group-2", &[]));
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git, agent);

        let report = report(run(dir.path(), &yaml_options(Some(1)), &deps));
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.stage, Some(Stage::Merge));
        let message = report.message.unwrap();
        assert!(message.contains("git merge --no-edit ralphy/integration-group-2"));
        // The work itself finished before integration failed.
        assert_eq!(report.completed, 2);
    }

    #[test]
    fn markdown_backlog_is_one_group_with_direct_merge() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("PRD.md"), "- [ ] First\n- [ ] Second\n").unwrap();

        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git.clone(), agent);
        let opts = PrdOptions {
            parallel: true,
            retry_delay: 0,
            ..Default::default()
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.completed, 2);

        let state = git.state();
        assert_eq!(state.worktree_adds, 1);
        // No integration branches; the group branch merges straight to base.
        assert!(!state.branch_bases.keys().any(|b| b.contains("integration")));
        assert!(state
            .merges
            .contains(&("main".to_string(), "ralphy/parallel/default".to_string())));
        assert_eq!(state.branches, vec!["main".to_string()]);
    }

    #[test]
    fn unresolved_conflicts_report_remaining_branches() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("PRD.md"), "- [ ] Only\n").unwrap();

        let git = Arc::new(FakeGit::failing_merge(
            "ralphy/parallel/default",
            &["src/conflicted.rs"],
        ));
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git.clone(), agent.clone());
        let opts = PrdOptions {
            parallel: true,
            retry_delay: 0,
            ..Default::default()
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.stage, Some(Stage::Merge));
        assert_eq!(
            report.message.as_deref(),
            Some("Merge conflicts remain in: ralphy/parallel/default")
        );

        // The resolver ran the agent once and aborted the merge.
        assert_eq!(agent.invocations(), 2); // 1 task + 1 resolution attempt
        assert_eq!(git.state().aborts, 1);
    }

    #[test]
    fn group_failure_stops_integration() {
        let dir = workspace_yaml(
            "tasks:\n  - title: Doomed\n    parallel_group: 1\n  - title: Skipped\n    parallel_group: 1\n",
        );
        let git = Arc::new(FakeGit::new());
        let deps = deps(git.clone(), Arc::new(FailingAgent));
        let opts = PrdOptions {
            max_retries: 1,
            ..yaml_options(Some(1))
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.stage, Some(Stage::Agent));
        assert_eq!(report.task.as_deref(), Some("Doomed"));
        // The second task of the group was never attempted.
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.completed, 0);
        // Nothing was merged into the base.
        assert!(git.state().merges.iter().all(|(t, _)| t != "main"));
    }

    #[test]
    fn rejects_branch_per_task_and_pr_flags() {
        let dir = workspace_yaml("tasks:\n  - title: A\n");
        let git = Arc::new(FakeGit::new());
        let deps = deps(git, Arc::new(FakeAgent::new()));
        let opts = PrdOptions {
            branch_per_task: true,
            ..yaml_options(None)
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.stage, Some(Stage::Pr));
    }

    #[test]
    fn rejects_issue_tracker_sources() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        let git = Arc::new(FakeGit::new());
        let deps = deps(git, Arc::new(FakeAgent::new()));
        let opts = PrdOptions {
            source: crate::task::SourceOptions {
                github: Some("owner/repo".into()),
                ..Default::default()
            },
            parallel: true,
            ..Default::default()
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.stage, Some(Stage::TaskSource));
    }

    #[test]
    fn completed_tasks_are_skipped_and_truncation_respected() {
        let dir = workspace_yaml(
            "tasks:\n  - title: Done already\n    completed: true\n  - title: A\n    parallel_group: 1\n  - title: B\n    parallel_group: 2\n",
        );
        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git, agent.clone());
        let opts = PrdOptions {
            max_iterations: Some(1),
            ..yaml_options(Some(1))
        };

        let report = report(run(dir.path(), &opts, &deps));
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.stopped, Some(StopReason::MaxIterations));
        assert_eq!(report.completed, 1);
        assert_eq!(report.tasks[0].task, "A");
        assert_eq!(agent.invocations(), 1);
    }

    #[test]
    fn worktree_copies_get_completion_marks() {
        let dir = workspace_yaml("tasks:\n  - title: Solo\n    parallel_group: 1\n");
        let git = Arc::new(FakeGit::new());
        let agent = Arc::new(FakeAgent::new());
        let deps = deps(git, agent);

        let report = report(run(dir.path(), &yaml_options(None), &deps));
        assert_eq!(report.status, RunStatus::Ok);

        // The copy inside the (fake) worktree was marked complete; the
        // original task file is untouched.
        let copy = dir
            .path()
            .join(".ralphy/worktrees/1/tasks.yaml");
        let copied = fs::read_to_string(copy).unwrap();
        assert!(copied.contains("completed: true"));
        let original = fs::read_to_string(dir.path().join("tasks.yaml")).unwrap();
        assert!(!original.contains("completed: true"));
    }
}
