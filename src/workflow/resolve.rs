use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentRunner, Engine};
use crate::cmd::CommandRunner;
use crate::git;

/// Ask the agent to resolve an in-progress merge with conflicts.
///
/// Invokes the agent exactly once. If conflicts remain afterwards the merge
/// is aborted and an error surfaces; if the agent resolved everything but a
/// merge is still in progress, it is committed with `--no-edit`.
pub fn resolve_conflicts(
    workdir: &Path,
    engine: Engine,
    git: &dyn CommandRunner,
    agent: &dyn AgentRunner,
) -> Result<()> {
    let files = git::conflicted_files(git, workdir)?;
    if files.is_empty() {
        return Ok(());
    }
    info!(files = files.len(), "resolve:conflicts detected");

    let prompt = conflict_prompt(&files);
    let request = AgentRequest {
        engine,
        prompt: &prompt,
        workdir,
        env: &[],
        last_message_path: None,
    };
    if let Err(err) = agent.invoke(&request) {
        warn!(error = %err, "resolve:agent invocation failed");
    }

    let remaining = git::conflicted_files(git, workdir)?;
    if remaining.is_empty() {
        if git::merge_in_progress(git, workdir)? {
            git::commit_no_edit(git, workdir)?;
        }
        info!("resolve:merge resolved");
        return Ok(());
    }

    git::abort_merge(git, workdir);
    Err(anyhow!("Merge conflict could not be resolved automatically"))
}

fn conflict_prompt(files: &[String]) -> String {
    let listing = files
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "A git merge is in progress in this repository and the following files have conflicts:\n\n\
        {}\n\n\
        Read each conflicted file, resolve the conflicts by removing the conflict markers \
        (<<<<<<<, =======, >>>>>>>) while keeping the intent of both sides, then stage each \
        resolved file with `git add`, and finally run `git commit --no-edit` to complete the merge.",
        listing
    )
}
