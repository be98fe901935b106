use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::cmd::CommandRunner;
use crate::git;
use crate::naming;

/// Default worktree root, relative to the main working directory.
pub const DEFAULT_WORKTREE_ROOT: &str = ".ralphy/worktrees";

/// One live worktree owned by the manager.
#[derive(Debug, Clone)]
pub struct WorktreeRecord {
    pub group: String,
    pub branch: String,
    pub path: PathBuf,
    pub task_source_path: Option<PathBuf>,
    /// Where the task source was copied to inside the worktree.
    pub copied_task_source: Option<PathBuf>,
}

/// Cleanup behavior. `remove_branches` defaults to true; signal-driven
/// teardown passes `preserve_dirty` so partial work stays inspectable.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub remove_branches: bool,
    pub preserve_dirty: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            remove_branches: true,
            preserve_dirty: false,
        }
    }
}

/// Allocates and destroys isolated git worktrees under a root directory.
/// The manager owns the disk paths and the branches it created.
pub struct WorktreeManager {
    git: Arc<dyn CommandRunner>,
    /// The main working directory of the repository.
    repo_dir: PathBuf,
    root: PathBuf,
    default_base: Option<String>,
    records: Vec<WorktreeRecord>,
}

impl WorktreeManager {
    pub fn new(
        git: Arc<dyn CommandRunner>,
        repo_dir: PathBuf,
        root: Option<PathBuf>,
        default_base: Option<String>,
    ) -> Self {
        let root = root.unwrap_or_else(|| repo_dir.join(DEFAULT_WORKTREE_ROOT));
        Self {
            git,
            repo_dir,
            root,
            default_base,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[WorktreeRecord] {
        &self.records
    }

    /// Create a worktree for `group` on a fresh `ralphy/parallel/<slug>`
    /// branch, optionally copying the task source file into it.
    pub fn allocate(
        &mut self,
        group: &str,
        base: Option<&str>,
        task_source: Option<&Path>,
    ) -> Result<WorktreeRecord> {
        let base = match base {
            Some(base) => base.to_string(),
            None => match &self.default_base {
                Some(base) => base.clone(),
                None => git::current_branch(self.git.as_ref(), &self.repo_dir)?,
            },
        };

        let group_slug = naming::slug(group);
        let live = git::list_branches(self.git.as_ref(), &self.repo_dir)?;
        let branch = naming::unique_name(&format!("ralphy/parallel/{}", group_slug), &live);

        let path = self.unique_path(&group_slug);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create worktree directory {}", path.display()))?;

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid worktree path"))?;
        git::run_git(
            self.git.as_ref(),
            &self.repo_dir,
            &["worktree", "add", "-b", &branch, path_str, &base],
        )
        .context("Failed to create worktree")?;

        let copied_task_source = match task_source {
            Some(source) => Some(self.copy_task_source(source, &path)?),
            None => None,
        };

        info!(group = group, branch = %branch, path = %path.display(), "worktree:allocated");
        let record = WorktreeRecord {
            group: group.to_string(),
            branch,
            path,
            task_source_path: task_source.map(Path::to_path_buf),
            copied_task_source,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    // Same relative location inside the worktree, or the basename when the
    // source lives outside the repository.
    fn copy_task_source(&self, source: &Path, worktree: &Path) -> Result<PathBuf> {
        let relative = source
            .strip_prefix(&self.repo_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| {
                PathBuf::from(source.file_name().unwrap_or(source.as_os_str()))
            });

        let dest = worktree.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create directory {}", parent.display())
            })?;
        }
        fs::copy(source, &dest).with_context(|| {
            format!(
                "Failed to copy task source {} into worktree",
                source.display()
            )
        })?;
        debug!(dest = %dest.display(), "worktree:task source copied");
        Ok(dest)
    }

    fn unique_path(&self, group_slug: &str) -> PathBuf {
        let candidate = self.root.join(group_slug);
        if !candidate.exists() {
            return candidate;
        }
        let mut counter = 2;
        loop {
            let next = self.root.join(format!("{}-{}", group_slug, counter));
            if !next.exists() {
                return next;
            }
            counter += 1;
        }
    }

    /// Remove worktrees (and by default their branches). Dirty worktrees are
    /// retained when `preserve_dirty` is set and stay on the record list for
    /// a later pass. Errors are collected; the aggregate is returned after
    /// every record has been visited.
    pub fn cleanup(&mut self, opts: &CleanupOptions) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let mut retained: Vec<WorktreeRecord> = Vec::new();

        for record in std::mem::take(&mut self.records) {
            if opts.preserve_dirty {
                match git::is_dirty(self.git.as_ref(), &record.path) {
                    Ok(true) => {
                        warn!(path = %record.path.display(), "worktree:dirty, preserved");
                        retained.push(record);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        errors.push(err.to_string());
                        retained.push(record);
                        continue;
                    }
                }
            }

            let path_str = record.path.to_string_lossy();
            if let Err(err) = git::run_git(
                self.git.as_ref(),
                &self.repo_dir,
                &["worktree", "remove", "--force", path_str.as_ref()],
            ) {
                errors.push(err.to_string());
                retained.push(record);
                continue;
            }

            if opts.remove_branches
                && let Err(err) =
                    git::delete_branch(self.git.as_ref(), &self.repo_dir, &record.branch, true)
            {
                errors.push(err.to_string());
            }
            debug!(path = %record.path.display(), "worktree:removed");
        }

        self.records = retained;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Worktree cleanup failed:\n{}", errors.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdOutput;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeGit {
        state: Mutex<State>,
    }

    struct State {
        branches: Vec<String>,
        dirty_paths: Vec<PathBuf>,
        calls: Vec<(PathBuf, Vec<String>)>,
    }

    impl FakeGit {
        fn new(branches: &[&str]) -> Self {
            Self {
                state: Mutex::new(State {
                    branches: branches.iter().map(|s| s.to_string()).collect(),
                    dirty_paths: Vec::new(),
                    calls: Vec::new(),
                }),
            }
        }

        fn mark_dirty(&self, path: &Path) {
            self.state.lock().unwrap().dirty_paths.push(path.to_path_buf());
        }

        fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
            self.state.lock().unwrap().calls.clone()
        }
    }

    impl CommandRunner for FakeGit {
        fn run(&self, workdir: &Path, args: &[&str]) -> Result<CmdOutput> {
            let mut state = self.state.lock().unwrap();
            state.calls.push((
                workdir.to_path_buf(),
                args.iter().map(|s| s.to_string()).collect(),
            ));

            let ok = |stdout: &str| CmdOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            };

            let out = match args {
                ["rev-parse", "--abbrev-ref", "HEAD"] => ok("main"),
                ["branch", "--format=%(refname:short)"] => ok(&state.branches.join("\n")),
                ["worktree", "add", "-b", branch, _path, _base] => {
                    state.branches.push(branch.to_string());
                    ok("")
                }
                ["worktree", "remove", "--force", _path] => ok(""),
                ["branch", "-D", branch] => {
                    state.branches.retain(|b| b != branch);
                    ok("")
                }
                ["status", "--porcelain"] => {
                    if state.dirty_paths.iter().any(|p| p == workdir) {
                        ok("?? junk.txt")
                    } else {
                        ok("")
                    }
                }
                other => panic!("unexpected git call: {:?}", other),
            };
            Ok(out)
        }
    }

    fn manager(dir: &TempDir, git: Arc<FakeGit>) -> WorktreeManager {
        WorktreeManager::new(git, dir.path().to_path_buf(), None, None)
    }

    #[test]
    fn allocate_creates_branch_and_copies_source() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("tasks.yaml"), "tasks:\n  - title: A\n").unwrap();
        let git = Arc::new(FakeGit::new(&["main"]));
        let mut mgr = manager(&dir, git.clone());

        let record = mgr
            .allocate("1", None, Some(&dir.path().join("tasks.yaml")))
            .expect("allocate");

        assert_eq!(record.branch, "ralphy/parallel/1");
        assert!(record.path.starts_with(dir.path().join(".ralphy/worktrees")));
        assert_eq!(
            record.task_source_path.as_deref(),
            Some(dir.path().join("tasks.yaml").as_path())
        );
        let copied = record.copied_task_source.expect("copied");
        assert_eq!(copied, record.path.join("tasks.yaml"));
        assert!(copied.exists());
        assert_eq!(mgr.records().len(), 1);
    }

    #[test]
    fn allocate_disambiguates_branch_and_path() {
        let dir = TempDir::new().expect("temp dir");
        let git = Arc::new(FakeGit::new(&["main", "ralphy/parallel/default"]));
        let mut mgr = manager(&dir, git);

        // Occupy the preferred path on disk.
        fs::create_dir_all(dir.path().join(".ralphy/worktrees/default")).unwrap();

        let record = mgr.allocate("default", None, None).expect("allocate");
        assert_eq!(record.branch, "ralphy/parallel/default-2");
        assert!(record.path.ends_with("default-2"));
    }

    #[test]
    fn allocate_uses_explicit_base() {
        let dir = TempDir::new().expect("temp dir");
        let git = Arc::new(FakeGit::new(&["main", "integration"]));
        let mut mgr = manager(&dir, git.clone());

        mgr.allocate("2", Some("integration"), None).expect("allocate");
        let calls = git.calls();
        let add = calls
            .iter()
            .find(|(_, args)| args[0] == "worktree" && args[1] == "add")
            .expect("worktree add issued");
        assert_eq!(add.1.last().map(String::as_str), Some("integration"));
    }

    #[test]
    fn cleanup_removes_worktrees_and_branches() {
        let dir = TempDir::new().expect("temp dir");
        let git = Arc::new(FakeGit::new(&["main"]));
        let mut mgr = manager(&dir, git.clone());
        mgr.allocate("1", None, None).expect("allocate");
        mgr.allocate("2", None, None).expect("allocate");

        mgr.cleanup(&CleanupOptions::default()).expect("cleanup");
        assert!(mgr.records().is_empty());

        let calls = git.calls();
        let removes = calls
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some("worktree") && args[1] == "remove")
            .count();
        let branch_deletes = calls
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some("branch") && args[1] == "-D")
            .count();
        assert_eq!(removes, 2);
        assert_eq!(branch_deletes, 2);
    }

    #[test]
    fn cleanup_preserves_dirty_worktrees() {
        let dir = TempDir::new().expect("temp dir");
        let git = Arc::new(FakeGit::new(&["main"]));
        let mut mgr = manager(&dir, git.clone());
        let record = mgr.allocate("1", None, None).expect("allocate");
        git.mark_dirty(&record.path);

        mgr.cleanup(&CleanupOptions {
            remove_branches: false,
            preserve_dirty: true,
        })
        .expect("cleanup");

        // Dirty worktree retained, still tracked for a later pass.
        assert_eq!(mgr.records().len(), 1);
        let calls = git.calls();
        assert!(!calls
            .iter()
            .any(|(_, args)| args.first().map(String::as_str) == Some("worktree") && args[1] == "remove"));
    }

    #[test]
    fn cleanup_can_keep_branches() {
        let dir = TempDir::new().expect("temp dir");
        let git = Arc::new(FakeGit::new(&["main"]));
        let mut mgr = manager(&dir, git.clone());
        mgr.allocate("1", None, None).expect("allocate");

        mgr.cleanup(&CleanupOptions {
            remove_branches: false,
            preserve_dirty: false,
        })
        .expect("cleanup");

        assert!(!git
            .calls()
            .iter()
            .any(|(_, args)| args.first().map(String::as_str) == Some("branch") && args[1] == "-D"));
    }
}
