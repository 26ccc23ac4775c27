//! Glob-style key pattern matching for the KEYS command.
//!
//! Patterns support `*` (any run of characters) and `?` (any single
//! character); every other character matches literally. A pattern is
//! compiled once per command into an anchored regex, never per entry.

use crate::{KvError, KvResult};
use regex::Regex;

/// A compiled key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Option<Regex>,
}

impl KeyPattern {
    /// Compile a glob pattern into a matcher.
    pub fn compile(pattern: &str) -> KvResult<Self> {
        let mut translated = String::with_capacity(pattern.len() + 2);
        translated.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                '.' | '+' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\' => {
                    translated.push('\\');
                    translated.push(ch);
                }
                _ => translated.push(ch),
            }
        }
        translated.push('$');

        let regex = Regex::new(&translated)
            .map_err(|e| KvError::Serialization(format!("invalid key pattern: {e}")))?;
        Ok(Self { regex: Some(regex) })
    }

    /// A matcher that accepts every key (absent pattern).
    pub fn match_all() -> Self {
        Self { regex: None }
    }

    /// Whether the given key matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => true,
        }
    }
}
