use std::sync::OnceLock;

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::task::TaskSourceKind;

/// Whether the prompt frames a one-off task or a step in a PRD run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    #[default]
    Single,
    Prd,
}

/// Everything the composer folds into the agent prompt.
pub struct PromptInput<'a> {
    pub task: &'a str,
    pub mode: PromptMode,
    pub source: Option<TaskSourceKind>,
    pub source_path: Option<&'a str>,
    pub issue_body: Option<&'a str>,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_commit: bool,
    pub config: &'a Config,
}

const PROMPT_TEMPLATE: &str = r#"{%- if project.name -%}
You are working on {{ project.name }}{% if project.language %} ({{ project.language }}{% if project.framework %}, {{ project.framework }}{% endif %}){% endif %}.
{% if project.description %}{{ project.description }}
{% endif %}
{% endif -%}
# Task

{{ task }}
{% if issue_body %}
## Details

{{ issue_body }}
{% endif %}
# Instructions

- Implement the task above completely. Do not leave placeholders.
{%- if mode == "prd" %}
- This task is one item of a larger backlog{% if source_path %} tracked in {{ source_path }}{% endif %}; stay within its scope and do not start other backlog items.
{%- endif %}
{%- if not skip_tests %}
{%- if commands.test %}
- Verify your work by running `{{ commands.test }}` and make it pass.
{%- else %}
- Write or update tests covering the change and make them pass.
{%- endif %}
{%- endif %}
{%- if not skip_lint and commands.lint %}
- Run `{{ commands.lint }}` and fix any issues it reports.
{%- endif %}
{%- if commands.build %}
- Ensure `{{ commands.build }}` still succeeds.
{%- endif %}
{%- if auto_commit %}
- When the task is done, commit all changes with a concise descriptive message.
{%- else %}
- Do not commit; leave the changes in the working tree.
{%- endif %}
{%- if rules %}

# Project rules
{% for rule in rules %}
- {{ rule }}
{%- endfor %}
{%- endif %}
{%- if never_touch %}

# Never touch
{% for path in never_touch %}
- {{ path }}
{%- endfor %}
{%- endif %}
"#;

fn template_env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        env.add_template("task_prompt", PROMPT_TEMPLATE)
            .expect("built-in prompt template parses");
        env
    })
}

/// Render the agent prompt for a task.
pub fn compose(input: &PromptInput<'_>) -> Result<String> {
    let mode = match input.mode {
        PromptMode::Single => "single",
        PromptMode::Prd => "prd",
    };

    let context = minijinja::context! {
        task => input.task,
        mode => mode,
        source => input.source.map(|s| s.to_string()),
        source_path => input.source_path,
        issue_body => input.issue_body,
        skip_tests => input.skip_tests,
        skip_lint => input.skip_lint,
        auto_commit => input.auto_commit,
        project => &input.config.project,
        commands => &input.config.commands,
        rules => &input.config.rules,
        never_touch => &input.config.boundaries.never_touch,
    };

    template_env()
        .get_template("task_prompt")
        .context("Prompt template missing")?
        .render(context)
        .context("Failed to render prompt template")
}
