use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, trace};

/// Captured result of a subprocess that is allowed to fail.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, or a generic message when the process wrote nothing.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("Command exited with code {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// A builder for executing subprocesses with unified error handling.
/// Arguments are passed as an argv array; nothing is shell-interpolated.
pub struct Cmd {
    command: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Cmd {
    /// Create a new command builder
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &Path) -> Self {
        self.workdir = Some(path.to_path_buf());
        self
    }

    /// Add an environment variable on top of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The full command line, for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    fn spawn(&self) -> Result<Output> {
        trace!(command = %self.command, args = ?self.args, workdir = ?self.workdir, "cmd:run start");
        let mut cmd = Command::new(&self.command);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("Failed to execute command: {}", self.display()))
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        let output = self.spawn()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = %self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {}\n{}",
                self.display(),
                stderr.trim()
            ));
        }
        trace!(command = %self.command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    /// This is useful for commands that are used as checks (e.g., git rev-parse --verify)
    pub fn run_as_check(self) -> Result<bool> {
        let output = self.spawn()?;
        let success = output.status.success();
        trace!(command = %self.command, success, "cmd:check result");
        Ok(success)
    }

    /// Execute the command and capture stdout, stderr and the exit code without
    /// treating a non-zero exit as an error. The caller classifies the result.
    pub fn run_unchecked(self) -> Result<CmdOutput> {
        let output = self.spawn()?;
        let exit_code = output.status.code().unwrap_or(-1);
        trace!(command = %self.command, exit_code, "cmd:unchecked done");
        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

/// Swappable subprocess seam for a fixed program (`git`, `gh`).
///
/// Run functions take these as trait objects so tests can substitute
/// in-memory fakes instead of forking processes.
pub trait CommandRunner: Send + Sync {
    fn run(&self, workdir: &Path, args: &[&str]) -> Result<CmdOutput>;
}

/// Runs the real program via [`Cmd`].
pub struct SystemRunner {
    program: String,
}

impl SystemRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, workdir: &Path, args: &[&str]) -> Result<CmdOutput> {
        Cmd::new(self.program.as_str())
            .args(args.iter().copied())
            .workdir(workdir)
            .run_unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_unchecked_reports_exit_code() {
        let out = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run_unchecked()
            .expect("spawn succeeds");

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[test]
    fn run_fails_with_stderr_in_message() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 1"])
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn error_message_falls_back_to_exit_code() {
        let out = CmdOutput {
            stdout: String::new(),
            stderr: "  ".into(),
            exit_code: 7,
        };
        assert_eq!(out.error_message(), "Command exited with code 7");
    }
}
