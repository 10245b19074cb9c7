//! Resumable-identifier extraction from terminal output.
//!
//! The hosted program prints how to continue its state (for example
//! `claude --resume 0d6f...`) when it exits. The pattern is configurable;
//! its first capture group is the identifier.

use regex::Regex;
use std::sync::LazyLock;
use tether_core::{TetherError, TetherResult};

/// Default marker: `--resume <id>`.
pub const DEFAULT_RESUME_PATTERN: &str = r"--resume\s+([A-Za-z0-9][A-Za-z0-9_-]*)";

/// CSI, OSC, two-byte ESC sequences and stray C0 controls other than newline/tab.
static CONTROL_SEQUENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-Z\\-_]|[\x00-\x08\x0b-\x1f\x7f]",
    )
    .expect("control sequence regex is valid")
});

/// Finds resumable identifiers in the tail of a session's output.
#[derive(Debug, Clone)]
pub struct ResumeScanner {
    pattern: Regex,
    window: usize,
}

impl ResumeScanner {
    /// Compile `pattern`; it must contain at least one capture group.
    pub fn new(pattern: &str, window: usize) -> TetherResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| TetherError::Config(format!("invalid resume_pattern: {e}")))?;
        if pattern.captures_len() < 2 {
            return Err(TetherError::Config(
                "resume_pattern needs a capture group for the identifier".into(),
            ));
        }
        Ok(Self { pattern, window })
    }

    /// Number of trailing output bytes to scan.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Strip control sequences from `tail` and return the last identifier found.
    pub fn extract(&self, tail: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(tail);
        let plain = strip_control_sequences(&text);
        self.pattern
            .captures_iter(&plain)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Remove terminal control sequences, keeping printable text and line breaks.
pub fn strip_control_sequences(text: &str) -> String {
    CONTROL_SEQUENCES.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> ResumeScanner {
        ResumeScanner::new(DEFAULT_RESUME_PATTERN, 4096).unwrap()
    }

    #[test]
    fn strips_colors_and_titles() {
        let raw = "\x1b[1;32mok\x1b[0m \x1b]0;title\x07done\r\n";
        assert_eq!(strip_control_sequences(raw), "ok done\n");
    }

    #[test]
    fn finds_marker_through_escape_codes() {
        let tail = b"Resume with: \x1b[2mclaude --resume \x1b[0m\x1b[36mabc-123\x1b[0m\r\n";
        assert_eq!(scanner().extract(tail).as_deref(), Some("abc-123"));
    }

    #[test]
    fn last_marker_wins() {
        let tail = b"claude --resume first-id\r\n...\r\nclaude --resume second-id\r\n";
        assert_eq!(scanner().extract(tail).as_deref(), Some("second-id"));
    }

    #[test]
    fn no_marker() {
        assert_eq!(scanner().extract(b"bye\r\n"), None);
        assert_eq!(scanner().extract(b""), None);
    }

    #[test]
    fn custom_pattern() {
        let s = ResumeScanner::new(r"session=(\d+)", 128).unwrap();
        assert_eq!(s.extract(b"session=7 session=42").as_deref(), Some("42"));
        assert_eq!(s.window(), 128);
    }

    #[test]
    fn pattern_without_group_rejected() {
        let err = ResumeScanner::new(r"--resume \S+", 128).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
        let err = ResumeScanner::new(r"(unclosed", 128).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }
}
