use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::{
    context::PromptContext,
    envelope::{FlowKind, MessageBody, keys},
    error::StepError,
    llm::{Completion, parse_json_reply},
    payload::ExtractedEntityPayload,
    retry::RetryPolicy,
    tool::{Tool, optional_str, required_str, result},
};

pub const DEFAULT_MAX_PAGE_CHARS: usize = 12_000;

const INSTRUCTIONS: &str = "Extract the posts, organizations, guests and software design patterns described in the page. \
Every pattern has a kind of either \"pattern\" or \"anti-pattern\". \
Links refer to entities by their exact name and may only name entities you also list. \
Dates use YYYY-MM-DD. Reply with one JSON object matching the schema and nothing else.";

/// Asks the LLM for an entity payload. The reply is stored unverified.
#[derive(Debug, Clone)]
pub struct ExtractEntities {
    llm: Arc<dyn Completion>,
    retry: RetryPolicy,
    max_page_chars: usize,
}

impl ExtractEntities {
    pub const NAME: &'static str = "extract_entities";

    pub fn new(llm: Arc<dyn Completion>, retry: RetryPolicy) -> Self {
        Self { llm, retry, max_page_chars: DEFAULT_MAX_PAGE_CHARS }
    }

    pub fn with_max_page_chars(mut self, max_page_chars: usize) -> Self {
        self.max_page_chars = max_page_chars;
        self
    }

    pub fn prompt(&self, url: Option<&str>, page_text: &str) -> PromptContext {
        let schema = serde_json::to_string_pretty(&schemars::schema_for!(ExtractedEntityPayload))
            .unwrap_or_else(|_| "{}".to_string());
        let text = truncate_chars(page_text, self.max_page_chars);
        let user = match url {
            Some(url) => format!("URL: {url}\n\n{text}"),
            None => text.to_string(),
        };
        PromptContext { system: format!("{INSTRUCTIONS}\n\nJSON Schema:\n{schema}\n"), user }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Tool for ExtractEntities {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[tracing::instrument(name = "tool_extract_entities", skip(self, kwargs))]
    async fn call(&self, _flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        let page_text = required_str(kwargs, keys::PAGE_TEXT)?;
        let prompt = self.prompt(optional_str(kwargs, keys::URL), page_text);

        let reply = self.retry.run(self.llm.name(), || self.llm.complete(&prompt)).await?;
        let payload = parse_json_reply(self.llm.name(), &reply)?;
        info!(provider = self.llm.name(), "entities extracted");

        Ok(result([(keys::PAYLOAD, payload), (keys::PAYLOAD_VERIFIED, json!(false))]))
    }
}
