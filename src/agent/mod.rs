pub mod executor;
pub mod output;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::Cmd;

/// The supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Claude,
    Opencode,
    Cursor,
    Qwen,
    Droid,
    Codex,
}

impl Engine {
    /// The executable to spawn. Cursor ships its CLI as `agent`.
    pub fn binary(&self) -> &'static str {
        match self {
            Engine::Claude => "claude",
            Engine::Opencode => "opencode",
            Engine::Cursor => "agent",
            Engine::Qwen => "qwen",
            Engine::Droid => "droid",
            Engine::Codex => "codex",
        }
    }

    /// Fixed argument template for a non-interactive run of this engine.
    pub fn args(&self, prompt: &str, last_message_path: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            Engine::Claude => vec![
                "--dangerously-skip-permissions".into(),
                "--verbose".into(),
                "--output-format".into(),
                "stream-json".into(),
                "-p".into(),
            ],
            Engine::Opencode => vec!["run".into(), "--format".into(), "json".into()],
            Engine::Cursor => vec![
                "--print".into(),
                "--force".into(),
                "--output-format".into(),
                "stream-json".into(),
            ],
            Engine::Qwen => vec![
                "--output-format".into(),
                "stream-json".into(),
                "--approval-mode".into(),
                "yolo".into(),
                "-p".into(),
            ],
            Engine::Droid => vec![
                "exec".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--auto".into(),
                "medium".into(),
            ],
            Engine::Codex => {
                let mut args: Vec<String> =
                    vec!["exec".into(), "--full-auto".into(), "--json".into()];
                if let Some(path) = last_message_path {
                    args.push("--output-last-message".into());
                    args.push(path.to_string_lossy().into_owned());
                }
                args
            }
        };
        args.push(prompt.to_string());
        args
    }

    /// Engine-specific environment, merged over the inherited one.
    pub fn env(&self) -> Vec<(String, String)> {
        match self {
            Engine::Opencode => vec![(
                "OPENCODE_PERMISSION".to_string(),
                r#"{"*":"allow"}"#.to_string(),
            )],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Engine::Claude => "claude",
            Engine::Opencode => "opencode",
            Engine::Cursor => "cursor",
            Engine::Qwen => "qwen",
            Engine::Droid => "droid",
            Engine::Codex => "codex",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Engine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Engine::Claude),
            "opencode" => Ok(Engine::Opencode),
            "cursor" | "agent" => Ok(Engine::Cursor),
            "qwen" => Ok(Engine::Qwen),
            "droid" => Ok(Engine::Droid),
            "codex" => Ok(Engine::Codex),
            other => Err(anyhow::anyhow!("Unknown agent engine: {}", other)),
        }
    }
}

/// One request to run an agent to completion.
pub struct AgentRequest<'a> {
    pub engine: Engine,
    pub prompt: &'a str,
    pub workdir: &'a Path,
    /// Caller overrides, applied after the engine's own environment.
    pub env: &'a [(String, String)],
    /// Codex only: where the agent writes its final message.
    pub last_message_path: Option<&'a Path>,
}

/// Raw process result of one agent invocation, unclassified.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Swappable seam over the agent subprocess.
pub trait AgentRunner: Send + Sync {
    fn invoke(&self, req: &AgentRequest<'_>) -> Result<AgentInvocation>;
}

/// Spawns the real agent binary.
pub struct CliAgentRunner;

impl AgentRunner for CliAgentRunner {
    fn invoke(&self, req: &AgentRequest<'_>) -> Result<AgentInvocation> {
        let mut cmd = Cmd::new(req.engine.binary())
            .args(req.engine.args(req.prompt, req.last_message_path))
            .workdir(req.workdir);
        for (key, value) in req.engine.env() {
            cmd = cmd.env(key, value);
        }
        for (key, value) in req.env {
            cmd = cmd.env(key, value);
        }

        let command = cmd.display();
        debug!(engine = %req.engine, workdir = %req.workdir.display(), "agent:invoke");
        let output = cmd.run_unchecked()?;
        debug!(engine = %req.engine, exit_code = output.exit_code, "agent:done");

        Ok(AgentInvocation {
            command,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_argument_template() {
        let args = Engine::Claude.args("do it", None);
        assert_eq!(
            args,
            vec![
                "--dangerously-skip-permissions",
                "--verbose",
                "--output-format",
                "stream-json",
                "-p",
                "do it"
            ]
        );
    }

    #[test]
    fn codex_includes_last_message_path() {
        let args = Engine::Codex.args("task", Some(Path::new("/tmp/last.txt")));
        assert_eq!(
            args,
            vec![
                "exec",
                "--full-auto",
                "--json",
                "--output-last-message",
                "/tmp/last.txt",
                "task"
            ]
        );

        let without = Engine::Codex.args("task", None);
        assert_eq!(without, vec!["exec", "--full-auto", "--json", "task"]);
    }

    #[test]
    fn cursor_binary_is_agent() {
        assert_eq!(Engine::Cursor.binary(), "agent");
        let args = Engine::Cursor.args("p", None);
        assert_eq!(
            args,
            vec!["--print", "--force", "--output-format", "stream-json", "p"]
        );
    }

    #[test]
    fn opencode_permission_env() {
        let env = Engine::Opencode.env();
        assert_eq!(
            env,
            vec![(
                "OPENCODE_PERMISSION".to_string(),
                r#"{"*":"allow"}"#.to_string()
            )]
        );
        assert!(Engine::Claude.env().is_empty());
    }

    #[test]
    fn engine_parses_aliases() {
        assert_eq!("agent".parse::<Engine>().unwrap(), Engine::Cursor);
        assert_eq!("CODEX".parse::<Engine>().unwrap(), Engine::Codex);
        assert!("gpt".parse::<Engine>().is_err());
    }
}
