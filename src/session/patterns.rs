//! Agent-type discovery: an ordered table of path patterns, first match
//! wins. The table is a process-wide, read-only derivation; tests swap it
//! with `load_patterns` and restore the defaults with `reset_patterns`.

use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::{HiveError, Result};

#[derive(Debug, Clone)]
pub struct AgentPattern {
    pub pattern: Regex,
    pub agent_type: String,
}

fn default_patterns() -> Vec<AgentPattern> {
    let rules: &[(&str, &str)] = &[
        (r"[/\\]\.claude[/\\]projects[/\\]", "claude-code"),
        (r"[/\\]\.codex[/\\]sessions[/\\]", "codex"),
        (r"[/\\]\.config[/\\]opencode[/\\]", "opencode"),
        (r"[/\\]\.aider[^/\\]*[/\\]", "aider"),
    ];
    rules
        .iter()
        .map(|(pattern, agent_type)| AgentPattern {
            pattern: Regex::new(pattern).expect("default agent pattern is valid"),
            agent_type: (*agent_type).to_string(),
        })
        .collect()
}

fn table() -> &'static RwLock<Vec<AgentPattern>> {
    static TABLE: OnceLock<RwLock<Vec<AgentPattern>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(default_patterns()))
}

/// First matching rule wins; `None` when the path is not a known agent
/// session location.
pub fn detect_agent_type(path: &str) -> Option<String> {
    let guard = table().read().ok()?;
    guard
        .iter()
        .find(|rule| rule.pattern.is_match(path))
        .map(|rule| rule.agent_type.clone())
}

/// Replace the pattern table, in order of precedence.
pub fn load_patterns(rules: &[(&str, &str)]) -> Result<()> {
    let mut compiled = Vec::with_capacity(rules.len());
    for (pattern, agent_type) in rules {
        let regex = Regex::new(pattern).map_err(|err| HiveError::Parse {
            line: 0,
            message: format!("bad agent pattern '{pattern}': {err}"),
        })?;
        compiled.push(AgentPattern {
            pattern: regex,
            agent_type: (*agent_type).to_string(),
        });
    }
    if let Ok(mut guard) = table().write() {
        *guard = compiled;
    }
    Ok(())
}

pub fn reset_patterns() {
    if let Ok(mut guard) = table().write() {
        *guard = default_patterns();
    }
}
