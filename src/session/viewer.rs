//! Deterministic context viewer for transcript files: a target line with
//! `context` lines either side, formatted for terminal output.

use std::path::Path;

use crate::error::{HiveError, Result};

pub const DEFAULT_CONTEXT: usize = 3;
const RULE_WIDTH: usize = 40;

/// Render `context` lines around 1-based `line`. Empty trailing lines are
/// dropped before the bounds check, so `line` ranges over 1..=N of the
/// meaningful content.
pub fn view(path: &Path, line: usize, context: usize) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let mut lines: Vec<&str> = content.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let max = lines.len();
    if line == 0 || line > max {
        return Err(HiveError::OutOfRange { line, max });
    }

    let start = line.saturating_sub(context).max(1);
    let end = (line + context).min(max);
    let rule = "-".repeat(RULE_WIDTH);

    let mut out = String::new();
    out.push_str(&format!("File: {}\n", path.display()));
    out.push_str(&format!("Line: {line} (context: {context})\n"));
    out.push_str(&rule);
    out.push('\n');
    for n in start..=end {
        let marker = if n == line { '>' } else { ' ' };
        out.push_str(&format!("{marker}{n:>5} | {}\n", lines[n - 1]));
    }
    out.push_str(&rule);
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn transcript(lines: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for i in 1..=lines {
            writeln!(file, "{{\"id\":{i}}}").unwrap();
        }
        file
    }

    #[test]
    fn renders_target_with_context() {
        let file = transcript(7);
        let out = view(file.path(), 4, 2).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert!(lines[0].starts_with("File: "));
        assert_eq!(lines[1], "Line: 4 (context: 2)");
        assert_eq!(lines[2], "-".repeat(40));
        assert_eq!(lines[3], "     2 | {\"id\":2}");
        assert_eq!(lines[5], ">    4 | {\"id\":4}");
        assert_eq!(lines[7], "     6 | {\"id\":6}");
        assert_eq!(lines[8], "-".repeat(40));
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn window_is_clamped_at_file_edges() {
        let file = transcript(7);
        // min(N, n+k) - max(1, n-k) + 1 content lines, exactly one marked.
        for (line, context, expected) in [(1, 3, 4), (7, 3, 4), (4, 100, 7), (4, 0, 1)] {
            let out = view(file.path(), line, context).unwrap();
            let content_lines = out.lines().count() - 4;
            assert_eq!(content_lines, expected, "line={line} context={context}");
            let marked = out.lines().filter(|l| l.starts_with('>')).count();
            assert_eq!(marked, 1);
            assert!(out.contains(&format!(">{line:>5} | ")));
        }
    }

    #[test]
    fn out_of_range_lines_fail() {
        let file = transcript(3);
        let err = view(file.path(), 4, 2).unwrap_err();
        assert!(matches!(err, HiveError::OutOfRange { line: 4, max: 3 }));
        let err = view(file.path(), 0, 2).unwrap_err();
        assert!(matches!(err, HiveError::OutOfRange { line: 0, max: 3 }));
    }

    #[test]
    fn trailing_blank_lines_are_dropped() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "one\ntwo\n\n\n").unwrap();
        let err = view(file.path(), 3, 1).unwrap_err();
        assert!(matches!(err, HiveError::OutOfRange { line: 3, max: 2 }));
        let out = view(file.path(), 2, 1).unwrap();
        assert!(out.contains(">    2 | two"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = view(Path::new("/nonexistent/session.jsonl"), 1, 1).unwrap_err();
        assert!(matches!(err, HiveError::Io(_)));
    }
}
