//! Output sanitization: credential redaction and size capping.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const REDACTION_MARKER: &str = "[REDACTED]";
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

// The key may carry a prefix (`GITHUB_TOKEN`, `DB_PASSWORD`); the whole
// `NAME=value` pair is replaced.
static CREDENTIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b[A-Za-z0-9_]*?(?:api[_-]?key|access[_-]?key|private[_-]?key|access[_-]?token|auth[_-]?token|token|password|passwd|secret|client[_-]?secret)\s*[=:]\s*["']?[^\s"'&;,]+["']?"#,
    )
    .expect("credential regex is valid")
});

static BEARER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*").expect("bearer regex is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedOutput {
    pub output: String,
    pub truncated: bool,
    pub original_size: usize,
}

/// Redact credential-shaped substrings, then cap the result at `max_size`
/// bytes followed by `TRUNCATION_MARKER`.
pub fn sanitize_output(text: &str, max_size: usize) -> SanitizedOutput {
    let redacted = redact_credentials(text);
    let (output, truncated) = truncate_with_marker(&redacted, max_size);
    SanitizedOutput {
        output,
        truncated,
        original_size: text.len(),
    }
}

pub fn redact_credentials(text: &str) -> String {
    let pass = CREDENTIAL_REGEX.replace_all(text, REDACTION_MARKER);
    BEARER_REGEX
        .replace_all(&pass, REDACTION_MARKER)
        .into_owned()
}

/// Keep at most `max_size` bytes (on a char boundary) and append the marker
/// when anything was dropped.
pub fn truncate_with_marker(text: &str, max_size: usize) -> (String, bool) {
    if text.len() <= max_size {
        return (text.to_string(), false);
    }
    let mut cut = max_size;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (format!("{}{}", &text[..cut], TRUNCATION_MARKER), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_redacted() {
        let result = sanitize_output("loading api_key=sk-live-12345 from env", 1024);
        assert_eq!(result.output, "loading [REDACTED] from env");
        assert!(!result.truncated);
    }

    #[test]
    fn test_other_credentials_redacted() {
        let text = "PASSWORD: hunter2\ntoken=\"abc.def\"\nAuthorization: Bearer eyJhbGciOi.xyz==\nsecret = s3cr3t";
        let result = sanitize_output(text, 4096);
        assert!(!result.output.contains("hunter2"));
        assert!(!result.output.contains("abc.def"));
        assert!(!result.output.contains("eyJhbGciOi"));
        assert!(!result.output.contains("s3cr3t"));
        assert_eq!(result.output.matches(REDACTION_MARKER).count(), 4);
    }

    #[test]
    fn test_prefixed_env_names_redacted() {
        for line in [
            "GITHUB_TOKEN=ghp_abc123",
            "MY_API_KEY=abc123",
            "DB_PASSWORD=hunter2",
            "AWS_SECRET=xyz",
            "AWS_SECRET_ACCESS_KEY=wJalrXUtnFEMI",
        ] {
            let result = sanitize_output(line, 1024);
            assert_eq!(result.output, REDACTION_MARKER, "{line} was not redacted");
        }

        let env_dump = "HOME=/home/ci\nNPM_AUTH_TOKEN=npm_live_999\nPATH=/usr/bin";
        let result = sanitize_output(env_dump, 1024);
        assert_eq!(result.output, "HOME=/home/ci\n[REDACTED]\nPATH=/usr/bin");
    }

    #[test]
    fn test_plain_output_untouched() {
        let result = sanitize_output("test result: ok. 12 passed; 0 failed", 1024);
        assert_eq!(result.output, "test result: ok. 12 passed; 0 failed");
        assert_eq!(result.original_size, 36);
    }

    #[test]
    fn test_truncation_respects_bound() {
        let text = "x".repeat(5000);
        let result = sanitize_output(&text, 100);
        assert!(result.truncated);
        assert!(result.output.len() <= 100 + TRUNCATION_MARKER.len());
        assert!(result.output.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.original_size, 5000);
    }

    #[test]
    fn test_truncation_on_char_boundary() {
        let text = "é".repeat(10);
        let (output, truncated) = truncate_with_marker(&text, 5);
        assert!(truncated);
        assert_eq!(output, format!("éé{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_bound_holds_when_redaction_expands_text() {
        let text = "token=a ".repeat(50);
        let result = sanitize_output(&text, 64);
        assert!(result.output.len() <= 64 + TRUNCATION_MARKER.len());
        assert!(!result.output.contains("token=a"));
    }
}
