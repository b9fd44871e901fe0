//! LLM completion capability.
//!
//! Completions are untrusted text: callers parse them with the helpers here
//! and treat anything unexpected as a malformed response.

pub mod ollama;
pub mod openai;

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;

use crate::{context::PromptContext, error::ExternalServiceError};

pub use ollama::OllamaCompletion;
pub use openai::OpenAiCompletion;

#[async_trait]
pub trait Completion: Send + Sync + Debug {
    /// Provider name used in logs and errors.
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &PromptContext) -> Result<String, ExternalServiceError>;
}

/// Body of the first fenced code block, or the trimmed text when there is none.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // skip the info string (```sql, ```json)
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after,
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// First JSON object in a completion, fenced or not.
pub fn parse_json_reply(service: &str, text: &str) -> Result<Value, ExternalServiceError> {
    let body = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }
    let malformed = |message: String| ExternalServiceError::MalformedResponse { service: service.to_string(), message };
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(malformed("no JSON object in completion".into()));
    };
    if end < start {
        return Err(malformed("no JSON object in completion".into()));
    }
    serde_json::from_str(&body[start..=end]).map_err(|e| malformed(format!("invalid JSON: {e}")))
}

pub(crate) fn transport_error(service: &str, err: &reqwest::Error) -> ExternalServiceError {
    if err.is_timeout() {
        ExternalServiceError::Timeout { service: service.to_string() }
    } else {
        ExternalServiceError::Transport { service: service.to_string(), message: err.to_string() }
    }
}
