//! Provider credentials and redaction of secrets from step errors.

use secrecy::{ExposeSecret, SecretBox};

/// A provider API key. Never printed by `Debug` or `Display`.
pub struct ApiKey(SecretBox<str>);

impl ApiKey {
    /// Wrap a raw key.
    #[must_use]
    pub fn new(key: String) -> Self {
        Self(SecretBox::new(key.into_boxed_str()))
    }

    /// Read a key from an environment variable, ignoring empty values.
    #[must_use]
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self::new)
    }

    /// The raw key, for request headers only.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

const REDACTED: &str = "[REDACTED]";

/// Replace the value following each occurrence of a pattern with `[REDACTED]`.
///
/// A value runs until whitespace, a quote, `&` or `,`.
#[must_use]
pub fn scrub_secrets(text: &str, patterns: &[&str]) -> String {
    patterns
        .iter()
        .fold(text.to_string(), |acc, pattern| redact_after(&acc, pattern))
}

fn redact_after(text: &str, pattern: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(pattern) {
        let value_start = pos + pattern.len();
        out.push_str(&rest[..value_start]);
        let tail = &rest[value_start..];
        let value_len = tail.find(is_value_end).unwrap_or(tail.len());
        if value_len > 0 {
            out.push_str(REDACTED);
        }
        rest = &tail[value_len..];
    }
    out.push_str(rest);
    out
}

fn is_value_end(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '\'' | '&' | ',')
}

/// Scrub with [`COMMON_SECRET_PATTERNS`], then mask bare provider keys
/// such as `sk-ant-...` that appear without a label.
#[must_use]
pub fn scrub_common_secrets(text: &str) -> String {
    let labelled = scrub_secrets(text, COMMON_SECRET_PATTERNS);
    BARE_KEY_PREFIXES
        .iter()
        .fold(labelled, |acc, prefix| redact_bare(&acc, prefix))
}

fn redact_bare(text: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(prefix) {
        let starts_word = rest[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_');
        let tail = &rest[pos..];
        let len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(tail.len());
        out.push_str(&rest[..pos]);
        if starts_word && len >= MIN_BARE_KEY_LEN {
            out.push_str(REDACTED);
        } else {
            out.push_str(&tail[..len]);
        }
        rest = &tail[len..];
    }
    out.push_str(rest);
    out
}

/// Labels whose trailing value is always a secret.
pub const COMMON_SECRET_PATTERNS: &[&str] = &[
    "api_key=",
    "apikey=",
    "api-key=",
    "token=",
    "secret=",
    "password=",
    "Authorization: Bearer ",
    "Authorization: Basic ",
    "x-api-key: ",
    "ANTHROPIC_API_KEY=",
    "GH_TOKEN=",
    "GITHUB_TOKEN=",
];

const BARE_KEY_PREFIXES: &[&str] = &["sk-ant-", "ghp_", "github_pat_"];
const MIN_BARE_KEY_LEN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_never_printed() {
        let key = ApiKey::new("sk-ant-api03-abcdef".to_string());

        assert_eq!(format!("{key:?}"), "ApiKey([REDACTED])");
        assert_eq!(format!("{key}"), "[REDACTED]");
        assert_eq!(key.expose(), "sk-ant-api03-abcdef");
    }

    #[test]
    fn test_labelled_values_are_redacted() {
        let scrubbed = scrub_secrets(
            "push failed: token=abc123, retry with api_key=xyz",
            &["api_key=", "token="],
        );
        assert_eq!(
            scrubbed,
            "push failed: token=[REDACTED], retry with api_key=[REDACTED]"
        );
    }

    #[test]
    fn test_empty_value_is_left_alone() {
        assert_eq!(scrub_secrets("token= missing", &["token="]), "token= missing");
    }

    #[test]
    fn test_header_and_bare_keys() {
        let scrubbed = scrub_common_secrets("request failed: x-api-key: sk-ant-999 (401)");
        assert_eq!(scrubbed, "request failed: x-api-key: [REDACTED] (401)");

        let scrubbed = scrub_common_secrets("gh said ghp_0123456789abcdefXYZ is revoked");
        assert_eq!(scrubbed, "gh said [REDACTED] is revoked");

        // Too short to be a real key.
        assert_eq!(scrub_common_secrets("see task-sk-ant-1"), "see task-sk-ant-1");
    }
}
