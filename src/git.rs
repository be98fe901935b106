pub mod branch;
pub mod worktree;

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::cmd::CommandRunner;

/// Run git through the injected runner, failing with the offending command
/// line and trimmed stderr on a non-zero exit.
pub fn run_git(git: &dyn CommandRunner, workdir: &Path, args: &[&str]) -> Result<String> {
    let output = git.run(workdir, args)?;
    if !output.success() {
        return Err(anyhow!(
            "Command failed: git {}\n{}",
            args.join(" "),
            output.stderr.trim()
        ));
    }
    Ok(output.stdout.trim().to_string())
}

/// Current branch name (`rev-parse --abbrev-ref HEAD`).
pub fn current_branch(git: &dyn CommandRunner, workdir: &Path) -> Result<String> {
    run_git(git, workdir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// True when the working tree has staged, unstaged or untracked changes.
pub fn is_dirty(git: &dyn CommandRunner, workdir: &Path) -> Result<bool> {
    let status = run_git(git, workdir, &["status", "--porcelain"])?;
    Ok(!status.is_empty())
}

/// All local branch names.
pub fn list_branches(git: &dyn CommandRunner, workdir: &Path) -> Result<Vec<String>> {
    let output = run_git(git, workdir, &["branch", "--format=%(refname:short)"])?;
    Ok(output
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

pub fn checkout(git: &dyn CommandRunner, workdir: &Path, branch: &str) -> Result<()> {
    run_git(git, workdir, &["checkout", branch])?;
    Ok(())
}

/// `git checkout -b <branch> <base>`
pub fn checkout_new_branch(
    git: &dyn CommandRunner,
    workdir: &Path,
    branch: &str,
    base: &str,
) -> Result<()> {
    run_git(git, workdir, &["checkout", "-b", branch, base])?;
    Ok(())
}

/// `git branch <branch> <base>` without switching to it.
pub fn create_branch(
    git: &dyn CommandRunner,
    workdir: &Path,
    branch: &str,
    base: &str,
) -> Result<()> {
    run_git(git, workdir, &["branch", branch, base])?;
    Ok(())
}

pub fn delete_branch(
    git: &dyn CommandRunner,
    workdir: &Path,
    branch: &str,
    force: bool,
) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    run_git(git, workdir, &["branch", flag, branch])?;
    Ok(())
}

pub fn merge_no_edit(git: &dyn CommandRunner, workdir: &Path, branch: &str) -> Result<()> {
    run_git(git, workdir, &["merge", "--no-edit", branch])?;
    Ok(())
}

/// Best-effort `git merge --abort`; failures are ignored.
pub fn abort_merge(git: &dyn CommandRunner, workdir: &Path) {
    let _ = run_git(git, workdir, &["merge", "--abort"]);
}

/// True when a merge is in progress (`MERGE_HEAD` resolves).
pub fn merge_in_progress(git: &dyn CommandRunner, workdir: &Path) -> Result<bool> {
    let output = git.run(workdir, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
    Ok(output.success() && !output.stdout.trim().is_empty())
}

pub fn commit_no_edit(git: &dyn CommandRunner, workdir: &Path) -> Result<()> {
    run_git(git, workdir, &["commit", "--no-edit"])?;
    Ok(())
}

/// Paths with unresolved merge conflicts.
pub fn conflicted_files(git: &dyn CommandRunner, workdir: &Path) -> Result<Vec<String>> {
    let output = run_git(git, workdir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(output
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Stash everything, including untracked files.
pub fn stash_push(git: &dyn CommandRunner, workdir: &Path, message: &str) -> Result<()> {
    run_git(git, workdir, &["stash", "push", "-u", "-m", message])?;
    Ok(())
}

/// The ref of the most recent stash entry, if any.
pub fn latest_stash_ref(git: &dyn CommandRunner, workdir: &Path) -> Result<Option<String>> {
    let output = run_git(git, workdir, &["stash", "list", "--format=%gd", "-n", "1"])?;
    let stash = output.trim();
    Ok(if stash.is_empty() {
        None
    } else {
        Some(stash.to_string())
    })
}

pub fn stash_pop(git: &dyn CommandRunner, workdir: &Path, stash_ref: &str) -> Result<()> {
    run_git(git, workdir, &["stash", "pop", stash_ref])?;
    Ok(())
}
