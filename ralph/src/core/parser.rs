//! Tiered recovery of an [`ActionEnvelope`] from free-text model output.
//!
//! Tiers run in order until one yields a JSON object:
//! 1. strict: the whole reply is JSON;
//! 2. tolerant: code fences and surrounding prose are stripped, then common
//!    syntax slips (trailing commas, single quotes, Python literals, raw
//!    newlines inside strings) are repaired;
//! 3. bracket matching: every balanced `{...}` span is tried, longest first.
//!
//! The object is then normalised (aliases, nested action objects) before typed
//! decoding, so garbage output is an ordinary `ParseError`, never a panic.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{Action, ActionEnvelope, PlanUpdate};
use crate::error::ParseError;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```[A-Za-z]*[ \t]*\r?\n?([\s\S]*?)```").unwrap()
});

/// Which recovery tier produced the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseTier {
    Strict,
    Tolerant,
    BracketMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub envelope: ActionEnvelope,
    pub tier: ParseTier,
    /// Extra execute blocks beyond the first, which are not run.
    pub dropped_actions: usize,
}

/// Parse raw model text into an envelope.
pub fn parse_envelope(raw: &str) -> Result<Parsed, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::new("empty response", raw));
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return decode(value, ParseTier::Strict, raw);
    }
    if let Some(value) = tolerant(trimmed) {
        return decode(value, ParseTier::Tolerant, raw);
    }
    if let Some(value) = bracket_match(trimmed) {
        return decode(value, ParseTier::BracketMatch, raw);
    }
    Err(ParseError::new("no JSON object found", raw))
}

fn tolerant(text: &str) -> Option<Value> {
    let mut candidates: Vec<&str> = FENCE_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim()))
        .collect();
    let unfenced = FENCE_RE.replace_all(text, "$1");
    let outer = outer_braces(&unfenced).map(str::to_string);
    candidates.retain(|c| c.starts_with('{'));

    candidates
        .into_iter()
        .map(str::to_string)
        .chain(outer)
        .find_map(|candidate| parse_object(&candidate))
}

fn outer_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_object(candidate: &str) -> Option<Value> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&repair(candidate)).ok())
        .filter(Value::is_object)
}

fn bracket_match(text: &str) -> Option<Value> {
    let mut spans = balanced_spans(text);
    spans.sort_by_key(|(start, end)| std::cmp::Reverse(end - start));
    let parsed: Vec<Value> = spans
        .into_iter()
        .filter_map(|(start, end)| parse_object(&text[start..end]))
        .collect();
    parsed
        .iter()
        .find(|value| has_envelope_key(value))
        .or_else(|| parsed.first())
        .cloned()
}

fn has_envelope_key(value: &Value) -> bool {
    ["chat", "execute", "done", "plan_update", "action"]
        .iter()
        .any(|key| value.get(key).is_some())
}

/// Byte ranges of every balanced `{...}` span, ignoring braces inside strings.
fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' if !stack.is_empty() => quote = Some(ch),
            '{' => stack.push(idx),
            '}' => {
                if let Some(start) = stack.pop() {
                    spans.push((start, idx + 1));
                }
            }
            _ => {}
        }
    }
    spans
}

/// Repair common JSON slips. Operates on a char scan so string contents survive.
pub fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match quote {
            Some(q) => {
                match ch {
                    '\\' if i + 1 < chars.len() => {
                        let next = chars[i + 1];
                        // `\'` is not a JSON escape in either quote style.
                        if next == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(next);
                        }
                        i += 1;
                    }
                    '"' if q == '\'' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if c == q => {
                        out.push('"');
                        quote = None;
                    }
                    c => out.push(c),
                }
                i += 1;
            }
            None => {
                match ch {
                    '"' | '\'' => {
                        out.push('"');
                        quote = Some(ch);
                    }
                    ',' => {
                        let next = chars[i + 1..].iter().copied().find(|c| !c.is_whitespace());
                        if !matches!(next, Some('}') | Some(']')) {
                            out.push(',');
                        }
                    }
                    c if c.is_ascii_alphabetic() => {
                        let start = i;
                        while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                            i += 1;
                        }
                        let word: String = chars[start..i].iter().collect();
                        out.push_str(match word.as_str() {
                            "True" => "true",
                            "False" => "false",
                            "None" => "null",
                            other => other,
                        });
                        continue;
                    }
                    c => out.push(c),
                }
                i += 1;
            }
        }
    }
    out
}

enum ExecBlock {
    Action(Action),
    Chat(String),
    Done,
}

fn decode(value: Value, tier: ParseTier, raw: &str) -> Result<Parsed, ParseError> {
    let Value::Object(mut map) = value else {
        return Err(ParseError::new("reply is not a JSON object", raw));
    };

    let mut chat = take_string(&mut map, &["chat", "message", "response", "thought"])
        .unwrap_or_default();
    let mut done = ["done", "complete", "finished"]
        .iter()
        .filter_map(|key| map.get(*key))
        .any(truthy);

    let plan_update = match map.remove("plan_update").or_else(|| map.remove("plan")) {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<PlanUpdate>(value)
                .map_err(|err| ParseError::new(format!("invalid plan_update: {err}"), raw))?,
        ),
    };

    let exec_value = match map.remove("execute") {
        Some(value) => Some(value),
        None if map.get("action").is_some_and(Value::is_string) => {
            Some(Value::Object(map.clone()))
        }
        None => map.remove("action"),
    };

    let (first, dropped_actions) = match exec_value {
        None | Some(Value::Null) => (None, 0),
        Some(Value::Array(items)) => {
            let mut items = items.into_iter().filter(|item| !item.is_null());
            let first = items.next();
            (first, items.count())
        }
        Some(value) => (Some(value), 0),
    };

    let mut execute = None;
    if let Some(block) = first {
        match normalize_exec(block, raw)? {
            ExecBlock::Action(action) => execute = Some(action),
            ExecBlock::Chat(message) => {
                if chat.is_empty() {
                    chat = message;
                }
            }
            ExecBlock::Done => done = true,
        }
    }

    Ok(Parsed {
        envelope: ActionEnvelope {
            chat,
            plan_update,
            execute,
            done,
        },
        tier,
        dropped_actions,
    })
}

fn normalize_exec(value: Value, raw: &str) -> Result<ExecBlock, ParseError> {
    let Value::Object(mut map) = value else {
        return Err(ParseError::new("execute block is not an object", raw));
    };

    if let Some(Value::Object(inner)) = map.remove("action") {
        for (key, value) in inner {
            map.insert(key, value);
        }
    }

    let kind = take_string(&mut map, &["type", "action", "kind"])
        .map(|kind| kind.trim().to_ascii_lowercase())
        .ok_or_else(|| ParseError::new("execute block has no type", raw))?;

    let kind = match kind.as_str() {
        "ls" | "dir" | "list_dir" | "list_files" => "list",
        "edit" | "create" | "write_file" | "create_file" => "write",
        "cat" | "read_file" | "open" => "read",
        "shell" | "bash" | "exec" | "command" | "run_command" => "run",
        "pytest" | "run_tests" | "tests" => "test",
        "chat" | "message" | "say" => {
            let message = take_string(&mut map, &["message", "chat", "content", "text"])
                .unwrap_or_default();
            return Ok(ExecBlock::Chat(message));
        }
        "done" | "finish" | "complete" => return Ok(ExecBlock::Done),
        other => other,
    };

    rename_key(&mut map, &["command", "cmd_line"], "cmd");
    rename_key(
        &mut map,
        &["file", "file_path", "filename", "filepath", "path_target", "target"],
        "path",
    );
    if kind == "write" {
        rename_key(&mut map, &["contents", "text", "data", "body"], "content");
    }
    map.insert("type".to_string(), Value::String(kind.to_string()));

    serde_json::from_value::<Action>(Value::Object(map))
        .map(ExecBlock::Action)
        .map_err(|err| ParseError::new(format!("invalid execute block: {err}"), raw))
}

fn rename_key(map: &mut Map<String, Value>, aliases: &[&str], canonical: &str) {
    if map.contains_key(canonical) {
        return;
    }
    for alias in aliases {
        if let Some(value) = map.remove(*alias) {
            map.insert(canonical.to_string(), value);
            return;
        }
    }
}

fn take_string(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(text)) = map.get(*key) {
            let text = text.clone();
            map.remove(*key);
            return Some(text);
        }
    }
    None
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(text.to_ascii_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}
