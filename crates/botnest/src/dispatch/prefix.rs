//! Command prefix resolution.
//!
//! The configured prefix takes one of four shapes: disabled (absent or
//! empty, any text is eligible), a single literal character, a longer
//! string treated as a character class, or a list of literals matched as
//! alternatives. All shapes compile to one anchored regex at startup.

use regex::Regex;
use thiserror::Error;

use crate::config::PrefixSpec;

#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("invalid prefix configuration: {0}")]
    Invalid(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    /// `None` means the prefix is disabled and every text is eligible.
    regex: Option<Regex>,
}

impl PrefixMatcher {
    pub fn disabled() -> Self {
        Self { regex: None }
    }

    pub fn from_spec(spec: Option<&PrefixSpec>) -> Result<Self, PrefixError> {
        let pattern = match spec {
            None => return Ok(Self::disabled()),
            Some(PrefixSpec::One(s)) if s.is_empty() => return Ok(Self::disabled()),
            Some(PrefixSpec::One(s)) if s.chars().count() == 1 => {
                format!("^(?:{})", regex::escape(s))
            }
            // A multi-character string is a set of single-character
            // prefixes, not one long literal.
            Some(PrefixSpec::One(s)) => format!("^[{}]", escape_class(s)),
            Some(PrefixSpec::Many(list)) => {
                let mut alternatives: Vec<&str> =
                    list.iter().map(String::as_str).filter(|s| !s.is_empty()).collect();
                if alternatives.is_empty() {
                    return Ok(Self::disabled());
                }
                // Longer literals first, so "!!" wins over "!"
                alternatives.sort_by_key(|s| std::cmp::Reverse(s.len()));
                let joined: Vec<String> =
                    alternatives.iter().map(|s| regex::escape(s)).collect();
                format!("^(?:{})", joined.join("|"))
            }
        };
        Ok(Self {
            regex: Some(Regex::new(&pattern)?),
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.regex.is_none()
    }

    /// Split `text` into the matched prefix and the remainder. With the
    /// prefix disabled the whole text is the remainder. `None` means the
    /// text does not start with any configured prefix.
    pub fn split<'a>(&self, text: &'a str) -> Option<(&'a str, &'a str)> {
        match &self.regex {
            None => Some(("", text)),
            Some(regex) => {
                let found = regex.find(text)?;
                Some((found.as_str(), &text[found.end()..]))
            }
        }
    }
}

/// Escape a string for use inside a regex character class.
fn escape_class(chars: &str) -> String {
    let mut out = String::with_capacity(chars.len() * 2);
    for c in chars.chars() {
        if matches!(c, '\\' | '^' | ']' | '-' | '[' | '&' | '~') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
