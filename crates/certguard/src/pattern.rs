//! Glob-style host patterns
//!
//! `*` matches any run of characters (including dots), `?` matches exactly
//! one. Matching is ASCII case-insensitive and anchored at both ends, so
//! `*.example.com` matches `a.example.com` and `a.b.example.com` but not
//! `example.com`.

use crate::error::GuardError;
use regex::Regex;
use std::fmt;

/// Compiled host pattern
#[derive(Clone)]
pub struct HostPattern {
    source: String,
    regex: Regex,
}

impl HostPattern {
    pub fn new(pattern: &str) -> Result<Self, GuardError> {
        let escaped = regex::escape(&pattern.to_ascii_lowercase())
            .replace("\\*", ".*")
            .replace("\\?", ".");

        let regex = Regex::new(&format!("^(?i:{})$", escaped))
            .map_err(|e| GuardError::InvalidPattern(pattern.to_string(), e.to_string()))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname.trim_end_matches('.'))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPattern").field(&self.source).finish()
    }
}

/// Ordered list of patterns; a host matches if any pattern does
#[derive(Debug, Clone, Default)]
pub struct HostPatternSet {
    patterns: Vec<HostPattern>,
}

impl HostPatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GuardError> {
        let patterns = patterns
            .iter()
            .map(|p| HostPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(hostname))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
