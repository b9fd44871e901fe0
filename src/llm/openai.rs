use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::error;

use crate::{
    context::PromptContext,
    error::{ExternalServiceError, ConfigurationError},
    llm::{Completion, transport_error},
};

pub const DEFAULT_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat Completions client.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self, ConfigurationError> {
        if api_key.trim().is_empty() {
            return Err(ConfigurationError::Setting {
                key: "OPENAI_KEY".into(),
                message: "required when LLM_PROVIDER=openai".into(),
            });
        }
        let client = Client::builder().timeout(timeout).build().map_err(|e| ConfigurationError::Setting {
            key: "OPENAI_URL".into(),
            message: format!("could not build HTTP client: {e}"),
        })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

fn choice_array_to_string(parts: Vec<Value>) -> String {
    parts
        .into_iter()
        .filter_map(|p| match p {
            Value::Object(mut obj) => obj.remove("text"),
            Value::String(s) => Some(Value::String(s)),
            _ => None,
        })
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Completion for OpenAiCompletion {
    fn name(&self) -> &str {
        "openai"
    }

    #[tracing::instrument(name = "openai_complete", skip(self, prompt), fields(model = %self.model))]
    async fn complete(&self, prompt: &PromptContext) -> Result<String, ExternalServiceError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), &e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI error: {}", text);
            return Err(ExternalServiceError::Http { service: self.name().into(), status: status.as_u16(), body: text });
        }

        let json: Value = resp.json().await.map_err(|e| ExternalServiceError::MalformedResponse {
            service: self.name().into(),
            message: format!("invalid response body: {e}"),
        })?;

        let content = json
            .pointer("/choices/0/message/content")
            .cloned()
            .ok_or_else(|| ExternalServiceError::MalformedResponse {
                service: self.name().into(),
                message: "response missing message content".into(),
            })?;

        Ok(match content {
            Value::String(s) => s,
            Value::Array(arr) => choice_array_to_string(arr),
            other => other.to_string(),
        })
    }
}
