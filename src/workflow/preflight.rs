use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::task::SourceOptions;

/// Check run requirements. Returns a list of human-readable failures;
/// empty means the run may proceed.
pub fn check_requirements(cwd: &Path, source: &SourceOptions) -> Vec<String> {
    let mut failures = Vec::new();

    if !cwd.join(".git").exists() {
        failures.push("Not a git repository (missing .git directory)".to_string());
    }

    if let Some(path) = source.file_path(cwd)
        && !path.exists()
    {
        failures.push(format!("Task source file not found: {}", path.display()));
    }

    if let Some(failure) = manifest_install_check(cwd) {
        failures.push(failure);
    }

    debug!(failures = failures.len(), "preflight:checked");
    failures
}

/// Project-manifest-implies-install-artifact hook.
///
/// Currently Node-flavoured: a `package.json` declaring dependencies or
/// dev-dependencies requires `node_modules` to exist. Kept in one place so
/// other ecosystems can be wired in.
fn manifest_install_check(cwd: &Path) -> Option<String> {
    let manifest = cwd.join("package.json");
    let content = std::fs::read_to_string(&manifest).ok()?;
    let parsed: Value = serde_json::from_str(&content).ok()?;

    let declares = ["dependencies", "devDependencies"].iter().any(|key| {
        parsed
            .get(key)
            .and_then(Value::as_object)
            .is_some_and(|deps| !deps.is_empty())
    });

    if declares && !cwd.join("node_modules").exists() {
        return Some(
            "Dependencies are not installed (package.json declares dependencies but node_modules is missing)"
                .to_string(),
        );
    }
    None
}
