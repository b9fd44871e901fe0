//! Error taxonomy shared by steps, tools, stores and the supervisor.
//!
//! Configuration errors are fatal for a request (or for startup). Everything
//! else that a step can raise is recoverable: the supervisor turns it into a
//! `decision = no` envelope and routes it to the error sink.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Decision, FlowKind};

/// Misconfiguration of the graph or the registries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no route from `{step}` on decision `{decision}` for flow {flow_kind}")]
    UnresolvedRoute {
        step: String,
        decision: Decision,
        flow_kind: FlowKind,
    },
    #[error("step `{0}` is not registered")]
    UnregisteredStep(String),
    #[error("tool `{0}` is not registered")]
    UnregisteredTool(String),
    #[error("no entry step configured for flow {0}")]
    MissingEntry(FlowKind),
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),
    #[error("invalid specification: {0}")]
    Specification(String),
    #[error("invalid setting `{key}`: {message}")]
    Setting { key: String, message: String },
}

/// Category of a single validation finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Structural,
    RequiredField,
    OrphanReference,
    Safety,
    Semantic,
    Request,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::Structural => "structural",
            ViolationKind::RequiredField => "required field",
            ViolationKind::OrphanReference => "orphan reference",
            ViolationKind::Safety => "safety",
            ViolationKind::Semantic => "semantic",
            ViolationKind::Request => "request",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Every violation found in one pass, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn single(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self { violations: vec![Violation::new(kind, message)] }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, kind: ViolationKind, message: impl Into<String>) {
        self.violations.push(Violation::new(kind, message));
    }

    /// Ok when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s): ", self.violations.len())?;
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Failure of an LLM, HTTP or database collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalServiceError {
    #[error("{service} returned HTTP {status}: {body}")]
    Http { service: String, status: u16, body: String },
    #[error("{service} transport error: {message}")]
    Transport { service: String, message: String },
    #[error("{service} timed out")]
    Timeout { service: String },
    #[error("{service} returned a malformed response: {message}")]
    MalformedResponse { service: String, message: String },
    #[error("database error: {0}")]
    Database(String),
}

impl ExternalServiceError {
    /// Transport failures, timeouts and 5xx/429 responses are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExternalServiceError::Transport { .. } | ExternalServiceError::Timeout { .. } => true,
            ExternalServiceError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// An upsert would break a uniqueness, foreign-key or check constraint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
}

/// Anything a step handler can raise.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    External(#[from] ExternalServiceError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StepError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Configuration(_))
    }
}

/// Why `Supervisor::process` gave up on a request.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("request exceeded the hop limit of {limit} steps (last step `{last_step}`)")]
    HopLimitExceeded { limit: usize, last_step: String },
    #[error("request timed out after {millis} ms")]
    Timeout { millis: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let mut err = ValidationError::default();
        err.push(ViolationKind::RequiredField, "posts[0].name is empty");
        err.push(ViolationKind::OrphanReference, "post_name \"Y\" not found");
        let text = err.to_string();
        assert!(text.starts_with("2 violation(s)"));
        assert!(text.contains("posts[0].name is empty"));
        assert!(text.contains("orphan reference: post_name \"Y\" not found"));
    }

    #[test]
    fn empty_validation_error_is_ok() {
        assert!(ValidationError::default().into_result().is_ok());
    }

    #[test]
    fn retryable_external_errors() {
        let t = ExternalServiceError::Timeout { service: "fetch".into() };
        assert!(t.is_retryable());
        let not_found = ExternalServiceError::Http { service: "fetch".into(), status: 404, body: String::new() };
        assert!(!not_found.is_retryable());
        let busy = ExternalServiceError::Http { service: "llm".into(), status: 503, body: String::new() };
        assert!(busy.is_retryable());
    }

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(StepError::from(ConfigurationError::UnregisteredTool("x".into())).is_fatal());
        assert!(!StepError::InvalidInput("x".into()).is_fatal());
    }
}
