//! Session transcript parsing: newline-delimited JSON into normalized
//! messages. Blank and malformed lines are skipped; `message_idx` is the
//! original 1-based line number, so ids stay stable when upstream tools
//! rewrite or truncate their transcripts.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::{MessageRole, SessionMessage};

pub fn parse_session_file(path: &Path, agent_type: &str) -> Result<Vec<SessionMessage>> {
    let content = std::fs::read_to_string(path)?;
    let fallback = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Ok(parse_session_str(
        &content,
        agent_type,
        Some(&path.to_string_lossy()),
        &fallback,
    ))
}

/// `fallback_session_id` is used when no line carries a session id,
/// typically the filename stem.
pub fn parse_session_str(
    content: &str,
    agent_type: &str,
    source_path: Option<&str>,
    fallback_session_id: &str,
) -> Vec<SessionMessage> {
    let mut messages = Vec::new();
    let mut session_id: Option<String> = None;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if session_id.is_none() {
            session_id = extract_session_id(&value);
        }
        let Some((role, content_text)) = extract_message(&value, agent_type) else {
            continue;
        };
        if content_text.trim().is_empty() {
            continue;
        }
        messages.push(SessionMessage {
            session_id: String::new(), // filled below once known
            agent_type: agent_type.to_string(),
            message_idx: line_no,
            timestamp: extract_timestamp(&value),
            role,
            content: content_text,
            source_path: source_path.map(|p| p.to_string()),
            metadata: None,
        });
    }

    let session_id = session_id.unwrap_or_else(|| fallback_session_id.to_string());
    for message in &mut messages {
        message.session_id = session_id.clone();
    }
    messages
}

fn extract_session_id(value: &Value) -> Option<String> {
    for key in ["sessionId", "session_id"] {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    value
        .get("payload")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.get("timestamp").or_else(|| value.get("ts"))?;
    if let Some(text) = raw.as_str() {
        return DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    // Numeric timestamps are unix milliseconds.
    raw.as_i64()
        .and_then(|ms| chrono::TimeZone::timestamp_millis_opt(&Utc, ms).single())
}

/// Pull `(role, content)` out of one transcript line. Claude Code wraps
/// the message in an envelope with a `type` discriminator; other agents
/// write flat `{role, content}` objects. Try the envelope first, then the
/// flat shape, so a misclassified agent type still parses.
fn extract_message(value: &Value, agent_type: &str) -> Option<(MessageRole, String)> {
    if agent_type == "claude-code"
        && let Some(result) = extract_envelope_message(value)
    {
        return Some(result);
    }
    if let Some(result) = extract_flat_message(value) {
        return Some(result);
    }
    extract_envelope_message(value)
}

fn extract_envelope_message(value: &Value) -> Option<(MessageRole, String)> {
    let kind = value.get("type").and_then(Value::as_str)?;
    if !matches!(kind, "user" | "assistant" | "system") {
        return None;
    }
    let message = value.get("message")?;
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or(kind)
        .parse()
        .ok()?;
    let content = flatten_content(message.get("content")?)?;
    Some((role, content))
}

fn extract_flat_message(value: &Value) -> Option<(MessageRole, String)> {
    let role = value.get("role").and_then(Value::as_str)?.parse().ok()?;
    let content = flatten_content(value.get("content")?)?;
    Some((role, content))
}

/// Content is either a plain string or an array of typed blocks; only the
/// text blocks contribute.
fn flatten_content(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|block| {
                    block.get("type").and_then(Value::as_str).unwrap_or("text") == "text"
                })
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_claude_code_envelopes() {
        let content = concat!(
            r#"{"type":"user","sessionId":"sess-42","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":"fix the watcher"}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"on it"},{"type":"tool_use","name":"bash"}]}}"#,
            "\n",
        );
        let messages = parse_session_str(content, "claude-code", Some("/p/s.jsonl"), "fallback");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].session_id, "sess-42");
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "fix the watcher");
        assert!(messages[0].timestamp.is_some());
        assert_eq!(messages[1].content, "on it");
        assert_eq!(messages[1].source_path.as_deref(), Some("/p/s.jsonl"));
    }

    #[test]
    fn message_idx_is_the_original_line_number() {
        let content = concat!(
            r#"{"role":"user","content":"one"}"#,
            "\n",
            "not json at all\n",
            "\n",
            r#"{"role":"assistant","content":"four"}"#,
            "\n",
        );
        let messages = parse_session_str(content, "codex", None, "s");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_idx, 1);
        assert_eq!(messages[1].message_idx, 4);
    }

    #[test]
    fn session_id_falls_back_to_filename_stem() {
        let content = r#"{"role":"user","content":"hello"}"#;
        let messages = parse_session_str(content, "codex", None, "2026-03-01-abcdef");
        assert_eq!(messages[0].session_id, "2026-03-01-abcdef");
    }

    #[test]
    fn tool_only_and_empty_lines_are_skipped() {
        let content = concat!(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","name":"grep"}]}}"#,
            "\n",
            r#"{"role":"user","content":"   "}"#,
            "\n",
            r#"{"summary":"no role here"}"#,
            "\n",
        );
        let messages = parse_session_str(content, "claude-code", None, "s");
        assert!(messages.is_empty());
    }

    #[test]
    fn numeric_timestamps_are_unix_millis() {
        let content = r#"{"role":"user","content":"hi","ts":1767225600000}"#;
        let messages = parse_session_str(content, "codex", None, "s");
        assert_eq!(
            messages[0].timestamp.unwrap().to_rfc3339(),
            "2026-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn flat_shape_parses_even_under_claude_type() {
        let content = r#"{"role":"user","content":"mislabeled agent"}"#;
        let messages = parse_session_str(content, "claude-code", None, "s");
        assert_eq!(messages.len(), 1);
    }
}
