use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use console::style;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::agent::Engine;
use crate::{logger, server};

#[derive(Parser, Debug)]
#[command(
    name = "ralphy",
    version,
    about = "Autonomous task loop that drives CLI coding agents through a PRD backlog",
    long_about = "Repeatedly picks the next incomplete task from a Markdown checklist, a YAML \
                  file or GitHub issues, hands it to an AI coding agent, validates the result \
                  and marks the task complete. Supports per-task branches, pull requests and \
                  parallel execution across git worktrees."
)]
#[command(after_help = "EXAMPLES:\n  \
    ralphy                                    # Work through PRD.md with Claude\n  \
    ralphy --yaml tasks.yaml --parallel       # Run task groups concurrently\n  \
    ralphy --github owner/repo                # Fetch tasks from GitHub issues\n  \
    ralphy --branch-per-task --create-pr      # Feature-branch workflow\n  \
    ralphy \"fix the login redirect\"           # One-off task\n  \
    ralphy --fast --dry-run                   # Preview without running anything\n\
")]
pub struct Cli {
    /// Task text for a one-off run; multiple words are joined with spaces
    #[arg(value_name = "TASK")]
    pub task: Vec<String>,

    /// Scaffold .ralphy/config.yaml in the current project
    #[arg(long)]
    pub init: bool,

    /// Print the effective configuration
    #[arg(long)]
    pub config: bool,

    /// Append a rule to the project configuration
    #[arg(long, value_name = "TEXT")]
    pub add_rule: Option<String>,

    /// Use Claude Code (default)
    #[arg(long, conflicts_with_all = ["opencode", "cursor", "codex", "qwen", "droid"])]
    pub claude: bool,

    /// Use OpenCode
    #[arg(long, conflicts_with_all = ["claude", "cursor", "codex", "qwen", "droid"])]
    pub opencode: bool,

    /// Use the Cursor agent
    #[arg(long, alias = "agent", conflicts_with_all = ["claude", "opencode", "codex", "qwen", "droid"])]
    pub cursor: bool,

    /// Use Codex
    #[arg(long, conflicts_with_all = ["claude", "opencode", "cursor", "qwen", "droid"])]
    pub codex: bool,

    /// Use Qwen-Code
    #[arg(long, conflicts_with_all = ["claude", "opencode", "cursor", "codex", "droid"])]
    pub qwen: bool,

    /// Use Droid
    #[arg(long, conflicts_with_all = ["claude", "opencode", "cursor", "codex", "qwen"])]
    pub droid: bool,

    /// Markdown task file (default: PRD.md)
    #[arg(long, value_name = "FILE", conflicts_with_all = ["yaml", "github"])]
    pub prd: Option<String>,

    /// YAML task file
    #[arg(long, value_name = "FILE", conflicts_with = "github")]
    pub yaml: Option<String>,

    /// Fetch tasks from GitHub issues of this repository
    #[arg(long, value_name = "REPO")]
    pub github: Option<String>,

    /// Only consider issues with this label
    #[arg(long, value_name = "LABEL", requires = "github")]
    pub github_label: Option<String>,

    /// Skip writing and running tests
    #[arg(long, alias = "no-tests")]
    pub skip_tests: bool,

    /// Skip linting
    #[arg(long, alias = "no-lint")]
    pub skip_lint: bool,

    /// Shorthand for --skip-tests --skip-lint
    #[arg(long)]
    pub fast: bool,

    /// Stop after N iterations
    #[arg(long, value_name = "N")]
    pub max_iterations: Option<usize>,

    /// Max agent attempts per task
    #[arg(long, default_value_t = 3, value_name = "N")]
    pub max_retries: usize,

    /// Seconds between attempts
    #[arg(long, default_value_t = 5, value_name = "SECONDS")]
    pub retry_delay: u64,

    /// Show what would be done without running the agent
    #[arg(long)]
    pub dry_run: bool,

    /// Run independent task groups in parallel worktrees
    #[arg(long)]
    pub parallel: bool,

    /// Max concurrent groups (only with --parallel)
    #[arg(long, value_name = "N", requires = "parallel")]
    pub max_parallel: Option<usize>,

    /// Create a git branch for each task
    #[arg(long)]
    pub branch_per_task: bool,

    /// Base branch for task branches (default: current branch)
    #[arg(long, value_name = "REF", requires = "branch_per_task")]
    pub base_branch: Option<String>,

    /// Open a pull request after each task (requires gh)
    #[arg(long, requires = "branch_per_task")]
    pub create_pr: bool,

    /// Open pull requests as drafts
    #[arg(long, requires = "create_pr")]
    pub draft_pr: bool,

    /// Ask the agent to commit its work (default)
    #[arg(long, overrides_with = "no_commit")]
    pub commit: bool,

    /// Leave changes uncommitted
    #[arg(long)]
    pub no_commit: bool,

    /// Log debug output to stderr
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Generate shell completions
    #[arg(long, value_enum, value_name = "SHELL", hide = true)]
    pub completions: Option<Shell>,
}

impl Cli {
    fn engine(&self) -> Engine {
        if self.opencode {
            Engine::Opencode
        } else if self.cursor {
            Engine::Cursor
        } else if self.codex {
            Engine::Codex
        } else if self.qwen {
            Engine::Qwen
        } else if self.droid {
            Engine::Droid
        } else {
            Engine::Claude
        }
    }

    fn skip_tests(&self) -> bool {
        self.skip_tests || self.fast
    }

    fn skip_lint(&self) -> bool {
        self.skip_lint || self.fast
    }

    fn auto_commit(&self) -> bool {
        !self.no_commit
    }
}

/// Parse arguments, boot the control plane, dispatch exactly one HTTP call
/// and report the result. Returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        generate(shell, &mut command, name, &mut std::io::stdout());
        return Ok(0);
    }

    logger::init(cli.verbose)?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "ralphy start");

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let handle = server::spawn(cwd)?;
    let client = reqwest::blocking::Client::new();

    let (method, path, payload) = request_for(&cli);
    if path.starts_with("/v1/run/") && which::which(cli.engine().binary()).is_err() {
        eprintln!(
            "{}",
            style(format!(
                "warning: agent binary '{}' not found in PATH",
                cli.engine().binary()
            ))
            .yellow()
        );
    }
    debug!(path, "cli:dispatch");

    let url = format!("{}{}", handle.base_url, path);
    let request = match method {
        "GET" => client.get(&url),
        _ => client.post(&url).json(&payload),
    };
    let response = request.send().context("Control plane request failed")?;
    let http_ok = response.status().is_success();
    let body: Value = response
        .json()
        .context("Control plane returned invalid JSON")?;

    println!("{}", serde_json::to_string_pretty(&body)?);

    let run_ok = http_ok && body.get("status").and_then(Value::as_str) != Some("error");
    if run_ok {
        eprintln!("{}", style("ralphy: done").green());
        Ok(0)
    } else {
        eprintln!("{}", style("ralphy: failed").red());
        Ok(1)
    }
}

/// Map the parsed flags to a control-plane call, by precedence:
/// init, config, add-rule, single task, PRD run.
fn request_for(cli: &Cli) -> (&'static str, &'static str, Value) {
    if cli.init {
        return ("POST", "/v1/config/init", json!({}));
    }
    if cli.config {
        return ("GET", "/v1/config", Value::Null);
    }
    if let Some(rule) = &cli.add_rule {
        return ("POST", "/v1/config/rules", json!({ "rule": rule }));
    }

    if !cli.task.is_empty() {
        let payload = json!({
            "task": cli.task.join(" "),
            "engine": cli.engine(),
            "skipTests": cli.skip_tests(),
            "skipLint": cli.skip_lint(),
            "autoCommit": cli.auto_commit(),
            "dryRun": cli.dry_run,
            "maxRetries": cli.max_retries,
            "retryDelay": cli.retry_delay,
            "promptMode": "single",
        });
        return ("POST", "/v1/run/single", payload);
    }

    let payload = json!({
        "prd": cli.prd,
        "yaml": cli.yaml,
        "github": cli.github,
        "githubLabel": cli.github_label,
        "maxIterations": cli.max_iterations,
        "maxRetries": cli.max_retries,
        "retryDelay": cli.retry_delay,
        "branchPerTask": cli.branch_per_task,
        "baseBranch": cli.base_branch,
        "createPr": cli.create_pr,
        "draftPr": cli.draft_pr,
        "skipTests": cli.skip_tests(),
        "skipLint": cli.skip_lint(),
        "autoCommit": cli.auto_commit(),
        "dryRun": cli.dry_run,
        "parallel": cli.parallel,
        "maxParallel": cli.max_parallel,
        "engine": cli.engine(),
    });
    ("POST", "/v1/run/prd", payload)
}
