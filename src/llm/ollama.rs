use async_trait::async_trait;
use ollama_rs::{Ollama, generation::completion::request::GenerationRequest};
use url::Url;

use crate::{
    context::PromptContext,
    error::{ConfigurationError, ExternalServiceError},
    llm::Completion,
};

pub const DEFAULT_MODEL: &str = "llama3.1";

/// Local Ollama server through `ollama_rs`.
#[derive(Debug, Clone)]
pub struct OllamaCompletion {
    client: Ollama,
    model: String,
}

impl OllamaCompletion {
    /// `url` like `http://localhost:11434`; `None` uses the library default.
    /// A URL without a port uses its scheme's default port.
    pub fn new(url: Option<&str>, model: &str) -> Result<Self, ConfigurationError> {
        let client = match url {
            Some(raw) => Ollama::builder().url(server_url(raw)?).build(),
            None => Ollama::default(),
        };
        Ok(Self { client, model: model.to_string() })
    }
}

fn server_url(raw: &str) -> Result<Url, ConfigurationError> {
    let setting = |message: String| ConfigurationError::Setting { key: "OLLAMA_URL".into(), message };
    let parsed = Url::parse(raw.trim()).map_err(|e| setting(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(setting(format!("`{raw}` must use http or https")));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(setting(format!("`{raw}` has no host")));
    }
    Ok(parsed)
}

#[async_trait]
impl Completion for OllamaCompletion {
    fn name(&self) -> &str {
        "ollama"
    }

    #[tracing::instrument(name = "ollama_complete", skip(self, prompt), fields(model = %self.model))]
    async fn complete(&self, prompt: &PromptContext) -> Result<String, ExternalServiceError> {
        let text = format!("{}\n\n{}", prompt.system, prompt.user);
        let req = GenerationRequest::new(self.model.clone(), text);
        let resp = self.client.generate(req).await.map_err(|e| ExternalServiceError::Transport {
            service: self.name().into(),
            message: e.to_string(),
        })?;
        Ok(resp.response)
    }
}
