use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::cmd::CommandRunner;
use crate::git;
use crate::naming;

const STASH_MESSAGE: &str = "ralphy: branch-per-task";

/// State captured at `prepare`, restored at `cleanup`.
#[derive(Debug, Clone)]
struct Prepared {
    original_branch: String,
    base_branch: String,
    stash_ref: Option<String>,
}

/// Per-task branch lifecycle for sequential branch-per-task runs.
///
/// prepare -> (checkout_for_task -> finish_task)* -> cleanup. The per-task
/// branches are left in place; their commits belong to the agent. Git errors
/// surface to the caller; nothing is retried.
pub struct BranchManager {
    git: Arc<dyn CommandRunner>,
    cwd: PathBuf,
    base_override: Option<String>,
    prepared: Option<Prepared>,
}

impl BranchManager {
    pub fn new(git: Arc<dyn CommandRunner>, cwd: PathBuf, base_override: Option<String>) -> Self {
        Self {
            git,
            cwd,
            base_override,
            prepared: None,
        }
    }

    /// Capture the original branch, stash a dirty tree, and move to the base
    /// branch when one was configured.
    pub fn prepare(&mut self) -> Result<()> {
        let original_branch = git::current_branch(self.git.as_ref(), &self.cwd)?;
        let base_branch = self
            .base_override
            .clone()
            .unwrap_or_else(|| original_branch.clone());

        let stash_ref = if git::is_dirty(self.git.as_ref(), &self.cwd)? {
            git::stash_push(self.git.as_ref(), &self.cwd, STASH_MESSAGE)?;
            let stash = git::latest_stash_ref(self.git.as_ref(), &self.cwd)?;
            debug!(stash = ?stash, "branch:stashed dirty tree");
            stash
        } else {
            None
        };

        if base_branch != original_branch {
            git::checkout(self.git.as_ref(), &self.cwd, &base_branch)?;
        }

        info!(original = %original_branch, base = %base_branch, "branch:prepared");
        self.prepared = Some(Prepared {
            original_branch,
            base_branch,
            stash_ref,
        });
        Ok(())
    }

    pub fn base_branch(&self) -> Option<&str> {
        self.prepared.as_ref().map(|p| p.base_branch.as_str())
    }

    /// Create and switch to a unique `ralphy/<slug>` branch off the base.
    pub fn checkout_for_task(&self, task: &str) -> Result<String> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| anyhow!("Branch manager was not prepared"))?;

        let live = git::list_branches(self.git.as_ref(), &self.cwd)?;
        let candidate = format!("ralphy/{}", naming::slug(task));
        let branch = naming::unique_name(&candidate, &live);

        git::checkout_new_branch(self.git.as_ref(), &self.cwd, &branch, &prepared.base_branch)?;
        info!(branch = %branch, base = %prepared.base_branch, "branch:task branch created");
        Ok(branch)
    }

    /// Return to the base branch, leaving the task branch in place.
    pub fn finish_task(&self) -> Result<()> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| anyhow!("Branch manager was not prepared"))?;
        git::checkout(self.git.as_ref(), &self.cwd, &prepared.base_branch)
    }

    /// Restore the original branch and pop the stash if one was taken.
    pub fn cleanup(&mut self) -> Result<()> {
        let Some(prepared) = self.prepared.take() else {
            return Ok(());
        };

        git::checkout(self.git.as_ref(), &self.cwd, &prepared.original_branch)?;
        if let Some(stash_ref) = prepared.stash_ref {
            git::stash_pop(self.git.as_ref(), &self.cwd, &stash_ref)?;
        }
        info!(branch = %prepared.original_branch, "branch:restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdOutput;
    use std::path::Path;
    use std::sync::Mutex;

    /// Minimal in-memory git: tracks branches, the checked-out branch,
    /// dirtiness and stash state, and records every argv it sees.
    struct FakeGit {
        state: Mutex<State>,
    }

    struct State {
        branches: Vec<String>,
        current: String,
        dirty: bool,
        stash: Vec<String>,
        calls: Vec<Vec<String>>,
    }

    impl FakeGit {
        fn new(current: &str, branches: &[&str], dirty: bool) -> Self {
            Self {
                state: Mutex::new(State {
                    branches: branches.iter().map(|s| s.to_string()).collect(),
                    current: current.to_string(),
                    dirty,
                    stash: Vec::new(),
                    calls: Vec::new(),
                }),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.state.lock().unwrap().calls.clone()
        }

        fn current(&self) -> String {
            self.state.lock().unwrap().current.clone()
        }
    }

    impl CommandRunner for FakeGit {
        fn run(&self, _workdir: &Path, args: &[&str]) -> Result<CmdOutput> {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(args.iter().map(|s| s.to_string()).collect());

            let ok = |stdout: &str| CmdOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            };

            let out = match args {
                ["rev-parse", "--abbrev-ref", "HEAD"] => ok(&state.current),
                ["status", "--porcelain"] => {
                    if state.dirty {
                        ok(" M src/lib.rs")
                    } else {
                        ok("")
                    }
                }
                ["branch", "--format=%(refname:short)"] => ok(&state.branches.join("\n")),
                ["checkout", "-b", branch, _base] => {
                    state.branches.push(branch.to_string());
                    state.current = branch.to_string();
                    ok("")
                }
                ["checkout", branch] => {
                    state.current = branch.to_string();
                    ok("")
                }
                ["stash", "push", "-u", "-m", _msg] => {
                    state.dirty = false;
                    state.stash.push("stash@{0}".into());
                    ok("")
                }
                ["stash", "list", "--format=%gd", "-n", "1"] => {
                    ok(state.stash.last().map(String::as_str).unwrap_or(""))
                }
                ["stash", "pop", _stash] => {
                    state.stash.pop();
                    state.dirty = true;
                    ok("")
                }
                other => panic!("unexpected git call: {:?}", other),
            };
            Ok(out)
        }
    }

    #[test]
    fn prepare_without_base_stays_on_original() {
        let git = Arc::new(FakeGit::new("main", &["main"], false));
        let mut mgr = BranchManager::new(git.clone(), PathBuf::from("."), None);
        mgr.prepare().expect("prepare");

        assert_eq!(mgr.base_branch(), Some("main"));
        assert_eq!(git.current(), "main");
        // No stash, no checkout happened.
        assert!(!git.calls().iter().any(|c| c[0] == "stash"));
    }

    #[test]
    fn prepare_stashes_dirty_tree_and_switches_base() {
        let git = Arc::new(FakeGit::new("feature", &["feature", "main"], true));
        let mut mgr =
            BranchManager::new(git.clone(), PathBuf::from("."), Some("main".to_string()));
        mgr.prepare().expect("prepare");

        assert_eq!(git.current(), "main");
        assert!(git.calls().iter().any(|c| c[0] == "stash" && c[1] == "push"));

        mgr.cleanup().expect("cleanup");
        assert_eq!(git.current(), "feature");
        assert!(git.calls().iter().any(|c| c[0] == "stash" && c[1] == "pop"));
    }

    #[test]
    fn checkout_for_task_slugs_and_disambiguates() {
        let git = Arc::new(FakeGit::new(
            "main",
            &["main", "ralphy/add-login"],
            false,
        ));
        let mut mgr = BranchManager::new(git.clone(), PathBuf::from("."), None);
        mgr.prepare().expect("prepare");

        let branch = mgr.checkout_for_task("Add login!").expect("checkout");
        assert_eq!(branch, "ralphy/add-login-2");
        assert_eq!(git.current(), "ralphy/add-login-2");

        mgr.finish_task().expect("finish");
        assert_eq!(git.current(), "main");
    }

    #[test]
    fn checkout_before_prepare_fails() {
        let git = Arc::new(FakeGit::new("main", &["main"], false));
        let mgr = BranchManager::new(git, PathBuf::from("."), None);
        assert!(mgr.checkout_for_task("task").is_err());
    }

    #[test]
    fn cleanup_is_a_no_op_when_unprepared() {
        let git = Arc::new(FakeGit::new("main", &["main"], false));
        let mut mgr = BranchManager::new(git.clone(), PathBuf::from("."), None);
        mgr.cleanup().expect("cleanup");
        assert!(git.calls().is_empty());
    }
}
