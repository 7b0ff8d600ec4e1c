// src/utils/logbook.rs
use serde::Serialize;
use std::{fs, io::Write, path::Path};

/// Append a single JSON value as a line to a JSONL file, creating parents.
pub fn append_jsonl<S: Serialize>(path: &Path, val: &S) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(val).map_err(std::io::Error::other)?;
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// Single-line preview: newlines removed, truncated on a char boundary with an ellipsis.
pub fn redact_preview(s: &str, max_chars: usize) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut t: String = flat.chars().take(max_chars).collect();
    t.push('…');
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(redact_preview("héllo\nworld", 5), "héllo…");
        assert_eq!(redact_preview("short", 10), "short");
    }

    #[test]
    fn appends_one_line_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested").join("log.jsonl");
        append_jsonl(&p, &serde_json::json!({"a": 1})).unwrap();
        append_jsonl(&p, &serde_json::json!({"a": 2})).unwrap();
        let text = fs::read_to_string(&p).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
