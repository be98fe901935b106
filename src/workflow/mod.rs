pub mod parallel;
pub mod preflight;
pub mod progress;
pub mod resolve;
pub mod sequential;
pub mod signals;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::agent::executor::{ExecOptions, ExecOutcome, execute_task};
use crate::agent::{AgentRunner, CliAgentRunner};
use crate::cmd::{CommandRunner, SystemRunner};
use crate::config::Config;
use crate::pr::{GhPrCreator, PrCreator};
use crate::task::TaskSource;

pub use types::{PrdOptions, PrdOutcome, SingleOptions};

/// Every external touchpoint of a run, swappable for tests.
///
/// Defaults spawn the real `git`, `gh` and agent binaries; tests substitute
/// in-memory fakes so the loops and the scheduler run without forking
/// processes.
pub struct RunDeps {
    pub git: Arc<dyn CommandRunner>,
    pub gh: Arc<dyn CommandRunner>,
    pub agent: Arc<dyn AgentRunner>,
    pub pr: Arc<dyn PrCreator>,
    /// Overrides task-source selection for the sequential loop.
    pub source: Option<Arc<dyn TaskSource>>,
}

impl Default for RunDeps {
    fn default() -> Self {
        let gh: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new("gh"));
        Self {
            git: Arc::new(SystemRunner::new("git")),
            pr: Arc::new(GhPrCreator::new(gh.clone())),
            gh,
            agent: Arc::new(CliAgentRunner),
            source: None,
        }
    }
}

/// Run the PRD backlog, sequentially or through the parallel scheduler.
pub fn run_prd(cwd: &Path, opts: &PrdOptions, deps: &RunDeps) -> PrdOutcome {
    info!(parallel = opts.parallel, source = %opts.source.kind(), "prd:run");
    if opts.parallel {
        parallel::run(cwd, opts, deps)
    } else {
        sequential::run(cwd, opts, deps)
    }
}

/// Execute one ad-hoc task in the working directory.
pub fn run_single(cwd: &Path, opts: &SingleOptions, deps: &RunDeps) -> ExecOutcome {
    let config = match Config::load(cwd) {
        Ok(config) => config,
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

    let exec_opts = ExecOptions {
        engine: opts.engine,
        skip_tests: opts.skip_tests,
        skip_lint: opts.skip_lint,
        auto_commit: opts.auto_commit,
        dry_run: opts.dry_run,
        max_retries: opts.max_retries,
        retry_delay_secs: opts.retry_delay,
        prompt_mode: opts.prompt_mode,
        task_source: opts.task_source,
        task_source_path: opts.task_source_path.clone(),
        issue_body: opts.issue_body.clone(),
        workdir: cwd.to_path_buf(),
        config,
    };
    execute_task(&opts.task, &exec_opts, deps.agent.as_ref())
}
