//! Case-insensitive wildcard patterns

use crate::error::Result;
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::fmt;

/// How a rule's image matcher applied to the requesting process.
///
/// Lower is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchLevel {
    /// `image.exe,...`
    Exact = 0,
    /// `!image.exe,...`
    Negated = 1,
    /// `*,...`
    All = 2,
    /// No image matcher
    Global = 3,
}

/// A compiled wildcard pattern (`*` any run, `?` one character)
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    level: MatchLevel,
    specificity: usize,
    wildcards: usize,
}

impl Pattern {
    pub fn new(source: &str, level: MatchLevel) -> Result<Self> {
        let mut expr = String::with_capacity(source.len() * 2 + 4);
        expr.push('^');
        let mut literal = String::new();
        for c in source.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()?;

        let wildcards = source.chars().filter(|c| matches!(c, '*' | '?')).count();
        let specificity = source
            .trim_end_matches('*')
            .chars()
            .filter(|c| !matches!(c, '*' | '?'))
            .count();

        Ok(Self {
            source: source.to_string(),
            regex,
            level,
            specificity,
            wildcards,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn level(&self) -> MatchLevel {
        self.level
    }

    /// Number of literal characters, a trailing `*` run ignored
    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn wildcards(&self) -> usize {
        self.wildcards
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Match `path`, and `path\` when it does not already end in `\`
    pub fn matches_path(&self, path: &str) -> bool {
        if self.is_match(path) {
            return true;
        }
        if !path.ends_with('\\') {
            let mut with_sep = String::with_capacity(path.len() + 1);
            with_sep.push_str(path);
            with_sep.push('\\');
            return self.is_match(&with_sep);
        }
        false
    }

    /// Rank used to pick between matching patterns
    pub fn rank(&self) -> Rank {
        Rank {
            level: self.level,
            specificity: self.specificity,
            wildcards: self.wildcards,
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("source", &self.source)
            .field("level", &self.level)
            .field("specificity", &self.specificity)
            .field("wildcards", &self.wildcards)
            .finish()
    }
}

/// Ordering key of a matching pattern; `Greater` means better
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub level: MatchLevel,
    pub specificity: usize,
    pub wildcards: usize,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then(self.specificity.cmp(&other.specificity))
            .then(other.wildcards.cmp(&self.wildcards))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
