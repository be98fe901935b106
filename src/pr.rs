use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::cmd::CommandRunner;

/// Inputs for opening a pull request.
///
/// The head branch is passed to `gh` verbatim; no sanitisation is applied.
pub struct PrRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub base: &'a str,
    pub head: &'a str,
    pub draft: bool,
}

/// Swappable seam over PR creation.
pub trait PrCreator: Send + Sync {
    /// Returns the PR URL reported by the tool.
    fn create(&self, workdir: &Path, req: &PrRequest<'_>) -> Result<String>;
}

/// Creates pull requests with the `gh` CLI.
pub struct GhPrCreator {
    gh: Arc<dyn CommandRunner>,
}

impl GhPrCreator {
    pub fn new(gh: Arc<dyn CommandRunner>) -> Self {
        Self { gh }
    }
}

impl PrCreator for GhPrCreator {
    fn create(&self, workdir: &Path, req: &PrRequest<'_>) -> Result<String> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            req.title,
            "--body",
            req.body,
            "--base",
            req.base,
            "--head",
            req.head,
        ];
        if req.draft {
            args.push("--draft");
        }

        let output = self.gh.run(workdir, &args)?;
        if !output.success() {
            return Err(anyhow!(output.error_message()));
        }

        let url = output.stdout.trim().to_string();
        info!(head = req.head, url = %url, "pr:created");
        Ok(url)
    }
}
