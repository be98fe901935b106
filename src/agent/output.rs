use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::Engine;

/// Token and cost accounting for one or more agent runs.
///
/// Token counts are always reported (defaulting to 0); `cost` and
/// `duration_ms` stay absent unless the agent reported them, so consumers can
/// distinguish "not reported" from "reported as zero".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Usage {
    /// Additive composition: tokens sum; optional fields sum over the
    /// contributors that reported them and stay absent otherwise.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost = match (self.cost, other.cost) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        self.duration_ms = match (self.duration_ms, other.duration_ms) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
}

/// Canonical decoded agent output.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    pub response: String,
    pub usage: Usage,
    pub error: Option<String>,
}

/// Decode an engine's streaming JSON stdout into `{response, usage, error?}`.
///
/// Lines that fail to decode are skipped; unknown event variants and fields
/// are ignored. One malformed line never fails the whole stream.
pub fn parse_agent_output(
    engine: Engine,
    stdout: &str,
    last_message_path: Option<&Path>,
) -> ParsedOutput {
    let events: Vec<Value> = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    trace!(engine = %engine, events = events.len(), "agent-output:decoded");

    if let Some(message) = find_error(&events) {
        return ParsedOutput {
            response: String::new(),
            usage: Usage::default(),
            error: Some(message),
        };
    }

    let mut parsed = match engine {
        Engine::Opencode => parse_opencode(&events),
        Engine::Codex => parse_codex(last_message_path),
        _ => parse_result_stream(engine, &events),
    };

    parsed.response = parsed.response.trim().to_string();
    parsed
}

fn find_error(events: &[Value]) -> Option<String> {
    events
        .iter()
        .find(|e| event_type(e) == Some("error"))
        .map(|e| {
            e.pointer("/error/message")
                .and_then(Value::as_str)
                .or_else(|| e.get("message").and_then(Value::as_str))
                .unwrap_or("Agent error")
                .to_string()
        })
}

fn parse_opencode(events: &[Value]) -> ParsedOutput {
    let response: String = events
        .iter()
        .filter(|e| event_type(e) == Some("text"))
        .filter_map(|e| e.pointer("/part/text").and_then(Value::as_str))
        .collect();

    let mut usage = Usage::default();
    if let Some(finish) = events
        .iter()
        .rev()
        .find(|e| event_type(e) == Some("step_finish"))
    {
        usage.input_tokens = finish
            .pointer("/tokens/input")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        usage.output_tokens = finish
            .pointer("/tokens/output")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        usage.cost = finish.get("cost").and_then(Value::as_f64);
    }

    ParsedOutput {
        response,
        usage,
        error: None,
    }
}

fn parse_codex(last_message_path: Option<&Path>) -> ParsedOutput {
    let response = last_message_path
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|content| {
            let trimmed = content.trim_start();
            match trimmed.strip_prefix("Task completed successfully.") {
                Some(rest) => rest.trim_start_matches(['\r', '\n']).to_string(),
                None => content,
            }
        })
        .unwrap_or_default();

    ParsedOutput {
        response,
        usage: Usage::default(),
        error: None,
    }
}

fn parse_result_stream(engine: Engine, events: &[Value]) -> ParsedOutput {
    let result_event = events.iter().find(|e| event_type(e) == Some("result"));

    let mut response = result_event
        .and_then(|e| e.get("result").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let mut usage = Usage::default();
    if let Some(event) = result_event {
        usage.input_tokens = event
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        usage.output_tokens = event
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        usage.duration_ms = event.get("duration_ms").and_then(Value::as_u64);
    }

    // Cursor sometimes puts the final text only on the assistant message.
    if engine == Engine::Cursor && response.is_empty() {
        response = events
            .iter()
            .filter(|e| event_type(e) == Some("assistant"))
            .filter_map(assistant_text)
            .collect::<Vec<_>>()
            .join("");
    }

    // Droid reports through a completion event when the result event is bare.
    if engine == Engine::Droid {
        if let Some(completion) = events
            .iter()
            .rev()
            .find(|e| event_type(e) == Some("completion"))
        {
            if response.is_empty()
                && let Some(text) = completion.get("finalText").and_then(Value::as_str)
            {
                response = text.to_string();
            }
            if usage.duration_ms.is_none() {
                usage.duration_ms = completion.get("durationMs").and_then(Value::as_u64);
            }
        }
    }

    ParsedOutput {
        response,
        usage,
        error: None,
    }
}

fn assistant_text(event: &Value) -> Option<String> {
    let content = event.pointer("/message/content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    let parts = content.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
    )
}

fn event_type(event: &Value) -> Option<&str> {
    event.get("type").and_then(Value::as_str)
}
