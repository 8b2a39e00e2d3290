//! Stream filters
//!
//! Configured as a [`FilterRule`], compiled once per config load into a
//! [`StreamFilter`].

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::format::RecordFormat;

/// Which streams a format records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterRule {
    /// Every stream
    #[default]
    All,
    /// Stream identifier starts with any pattern
    Prefix { patterns: Vec<String> },
    /// `*` matches within one path segment, `**` across segments, `?` one
    /// character
    Glob { patterns: Vec<String> },
    /// Unanchored regular expression search
    Regex { pattern: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    All,
    Prefix(Vec<String>),
    Patterns(Vec<Regex>),
}

/// Compiled filter
#[derive(Debug, Clone)]
pub struct StreamFilter {
    matcher: Matcher,
}

impl StreamFilter {
    /// Filter accepting every stream
    pub fn all() -> Self {
        Self {
            matcher: Matcher::All,
        }
    }

    pub fn compile(format: RecordFormat, rule: &FilterRule) -> Result<Self, ConfigError> {
        let matcher = match rule {
            FilterRule::All => Matcher::All,
            FilterRule::Prefix { patterns } => Matcher::Prefix(patterns.clone()),
            FilterRule::Glob { patterns } => {
                let compiled = patterns
                    .iter()
                    .map(|pattern| compile_glob(format, pattern))
                    .collect::<Result<Vec<_>, _>>()?;
                Matcher::Patterns(compiled)
            }
            FilterRule::Regex { pattern } => {
                let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
                    format,
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                Matcher::Patterns(vec![regex])
            }
        };
        Ok(Self { matcher })
    }

    pub fn matches(&self, stream: &str) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Prefix(prefixes) => prefixes.iter().any(|p| stream.starts_with(p.as_str())),
            Matcher::Patterns(regexes) => regexes.iter().any(|r| r.is_match(stream)),
        }
    }
}

/// Translate a glob into an anchored regex
fn compile_glob(format: RecordFormat, pattern: &str) -> Result<Regex, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidGlob {
        format,
        pattern: pattern.to_string(),
        message: message.to_string(),
    };

    if pattern.is_empty() {
        return Err(invalid("empty pattern"));
    }
    if pattern.contains("***") {
        return Err(invalid("'***' is ambiguous"));
    }

    let mut source = String::with_capacity(pattern.len() * 2 + 2);
    source.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                source.push_str(".*");
            }
            '*' => source.push_str("[^/]*"),
            '?' => source.push_str("[^/]"),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| invalid(&e.to_string()))
}
