use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Relative path of the project config file.
pub const PROJECT_CONFIG_PATH: &str = ".ralphy/config.yaml";

/// Returned by [`init`] when the project config is already present.
#[derive(Debug, thiserror::Error)]
#[error("Config already exists: {0}")]
pub struct ConfigExists(pub String);

/// Project identity, consumed by the prompt composer.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ProjectInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Commands the agent is asked to run to validate its work.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Commands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

/// Paths the agent must never modify.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Boundaries {
    #[serde(default)]
    pub never_touch: Vec<String>,
}

/// Configuration for ralphy, read from .ralphy/config.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectInfo,

    #[serde(default)]
    pub commands: Commands,

    #[serde(default)]
    pub rules: Vec<String>,

    #[serde(default)]
    pub boundaries: Boundaries,
}

impl Config {
    /// Load and merge global and project configurations for a working directory.
    /// The project file wins per-field; lists replace rather than append.
    pub fn load(cwd: &Path) -> Result<Self> {
        let global = Self::load_from_path(&global_config_path()?)?.unwrap_or_default();
        let project = Self::load_from_path(&cwd.join(PROJECT_CONFIG_PATH))?.unwrap_or_default();
        Ok(global.merge(project))
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!(path = %path.display(), "config:loaded");
        Ok(Some(config))
    }

    fn merge(self, other: Config) -> Config {
        Config {
            project: ProjectInfo {
                name: other.project.name.or(self.project.name),
                language: other.project.language.or(self.project.language),
                framework: other.project.framework.or(self.project.framework),
                description: other.project.description.or(self.project.description),
            },
            commands: Commands {
                test: other.commands.test.or(self.commands.test),
                lint: other.commands.lint.or(self.commands.lint),
                build: other.commands.build.or(self.commands.build),
            },
            rules: if other.rules.is_empty() {
                self.rules
            } else {
                other.rules
            },
            boundaries: if other.boundaries.never_touch.is_empty() {
                self.boundaries
            } else {
                other.boundaries
            },
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

fn global_config_path() -> Result<PathBuf> {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME")
        && !config_home.is_empty()
    {
        return Ok(PathBuf::from(config_home)
            .join("ralphy")
            .join("config.yaml"));
    }

    let home = home::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("ralphy").join("config.yaml"))
}

/// Scaffold `.ralphy/config.yaml` for the project at `cwd`.
/// Returns the created path, or an error if the file already exists.
pub fn init(cwd: &Path) -> Result<PathBuf> {
    let path = cwd.join(PROJECT_CONFIG_PATH);
    if path.exists() {
        return Err(ConfigExists(path.display().to_string()).into());
    }

    let name = cwd
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string());

    let config = Config {
        project: ProjectInfo {
            name,
            ..Default::default()
        },
        ..Default::default()
    };
    config.save(&path)?;
    Ok(path)
}

/// Append a rule to the project config, creating the file if needed.
pub fn add_rule(cwd: &Path, rule: &str) -> Result<()> {
    let path = cwd.join(PROJECT_CONFIG_PATH);
    let mut config = Config::load_from_path(&path)?.unwrap_or_default();
    config.rules.push(rule.to_string());
    config.save(&path)
}
