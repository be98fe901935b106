use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::debug;

/// Relative path of the append-only progress log.
pub const PROGRESS_PATH: &str = ".ralphy/progress.txt";

/// Append a `- [✓|✗] YYYY-MM-DD HH:MM - <task>` line to the progress log.
///
/// Only writes when the file already exists; creating it is the user's
/// opt-in. Write failures are swallowed — progress is best-effort and never
/// fails a run.
pub fn record(cwd: &Path, success: bool, task: &str) {
    let path = cwd.join(PROGRESS_PATH);
    if !path.exists() {
        return;
    }

    let mark = if success { '✓' } else { '✗' };
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M");
    let line = format!("- [{}] {} - {}\n", mark, timestamp, task);

    let result = OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if let Err(err) = result {
        debug!(error = %err, "progress:write failed (ignored)");
    }
}
