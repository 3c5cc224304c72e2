//! `%variable%` expansion in rule values

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Expands `%name%` references from a fixed variable table.
///
/// Names are case-insensitive. `%%` yields a literal `%`.
#[derive(Debug, Clone, Default)]
pub struct Expander {
    vars: HashMap<String, String>,
}

impl Expander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut expander = Self::new();
        for (name, value) in vars {
            expander.set(name.as_ref(), value);
        }
        expander
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Expand every reference in `text`.
    ///
    /// An unknown or unterminated reference is an error.
    pub fn expand(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('%')
                .ok_or_else(|| Error::Expand(format!("unterminated variable in {text:?}")))?;

            let name = &after[..end];
            if name.is_empty() {
                out.push('%');
            } else {
                let value = self
                    .get(name)
                    .ok_or_else(|| Error::Expand(format!("unknown variable %{name}%")))?;
                out.push_str(value);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
