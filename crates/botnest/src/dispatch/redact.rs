//! Redaction of fault reports before they reach any chat.
//!
//! Module failures are echoed back to the invoking chat and forwarded to
//! the owner set. Error strings routinely embed whatever was in flight at
//! the time, so every configured secret is stripped first and the result
//! is truncated.

use std::borrow::Cow;

use regex::{Regex, RegexSet};

/// Replacement text for stripped secrets.
const REDACTED: &str = "[redacted]";

/// Maximum characters of an error string shown in a chat.
const MAX_REPORT_LEN: usize = 600;

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Vec<Regex>,
    set: Option<RegexSet>,
}

impl Redactor {
    /// Build a redactor from configured secret substrings. Invalid or
    /// empty entries are skipped; a secret that cannot be compiled must
    /// not take the runtime down with it.
    pub fn new(secrets: &[String]) -> Self {
        let sources: Vec<String> = secrets
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| regex::escape(s))
            .collect();

        let patterns = sources
            .iter()
            .filter_map(|src| Regex::new(src).ok())
            .collect();
        let set = RegexSet::new(&sources).ok().filter(|s| !s.is_empty());

        Self { patterns, set }
    }

    /// Strip every configured secret from `input`.
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let touched = match &self.set {
            None => return Cow::Borrowed(input),
            Some(set) => set.is_match(input),
        };
        if !touched {
            return Cow::Borrowed(input);
        }

        let mut output = input.to_string();
        for pattern in &self.patterns {
            output = pattern.replace_all(&output, REDACTED).into_owned();
        }
        Cow::Owned(output)
    }

    /// Redact and truncate an error string for display in a chat.
    pub fn report(&self, input: &str) -> String {
        let redacted = self.redact(input);
        if redacted.chars().count() <= MAX_REPORT_LEN {
            return redacted.into_owned();
        }
        let truncated: String = redacted.chars().take(MAX_REPORT_LEN).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_secrets_are_stripped() {
        let redactor = Redactor::new(&["sk-live-abc123".to_string(), "hunter2".to_string()]);
        let out = redactor.redact("request failed: key sk-live-abc123 rejected (pw hunter2)");
        assert_eq!(
            out,
            "request failed: key [redacted] rejected (pw [redacted])"
        );
    }

    #[test]
    fn clean_input_is_borrowed_unchanged() {
        let redactor = Redactor::new(&["sk-live-abc123".to_string()]);
        let input = "connection reset by peer";
        match redactor.redact(input) {
            Cow::Borrowed(s) => assert_eq!(s, input),
            Cow::Owned(_) => panic!("expected borrowed passthrough"),
        }
    }

    #[test]
    fn empty_secret_list_is_a_passthrough() {
        let redactor = Redactor::new(&[]);
        assert_eq!(redactor.redact("anything"), "anything");
        assert_eq!(redactor.report("anything"), "anything");
    }

    #[test]
    fn secrets_with_metacharacters_match_literally() {
        let redactor = Redactor::new(&["a.b+c".to_string()]);
        assert_eq!(redactor.redact("token a.b+c here"), "token [redacted] here");
        assert_eq!(redactor.redact("token aXb+c here"), "token aXb+c here");
    }

    #[test]
    fn long_reports_are_truncated() {
        let redactor = Redactor::new(&[]);
        let long = "x".repeat(2000);
        let report = redactor.report(&long);
        assert!(report.chars().count() <= MAX_REPORT_LEN + 1);
        assert!(report.ends_with('…'));
    }
}
