use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::{context::Specification, error::ConfigurationError};

/// Statement terminator followed by a DML/DDL keyword.
pub const DEFAULT_PATTERN: &str = r";\s*(insert|update|delete|drop|alter|create|truncate|replace|merge|grant|revoke|attach|detach|pragma)\b";

static DEFAULT: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(DEFAULT_PATTERN)
        .case_insensitive(true)
        .build()
        .expect("default denylist pattern compiles")
});

/// Case-insensitive patterns that free text must not match.
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<Regex>,
}

impl Default for Denylist {
    fn default() -> Self {
        Self { patterns: vec![DEFAULT.clone()] }
    }
}

impl Denylist {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigurationError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigurationError::Specification(format!("denylist pattern `{p}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Patterns declared in the specification, or the default when none are.
    pub fn from_specification(specification: &Specification) -> Result<Self, ConfigurationError> {
        match &specification.denylist {
            Some(patterns) => Self::new(patterns),
            None => Ok(Self::default()),
        }
    }

    /// Source of the first pattern matching `text`.
    pub fn find(&self, text: &str) -> Option<&str> {
        self.patterns.iter().find(|re| re.is_match(text)).map(|re| re.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
