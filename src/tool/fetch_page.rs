use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::{
    envelope::{FlowKind, MessageBody, keys},
    error::{ExternalServiceError, StepError},
    fetch::{PageFetcher, html_to_text},
    retry::RetryPolicy,
    tool::{Tool, required_str, result},
};

/// Downloads the request URL and reduces it to visible text.
#[derive(Debug, Clone)]
pub struct FetchPage {
    fetcher: Arc<dyn PageFetcher>,
    retry: RetryPolicy,
}

impl FetchPage {
    pub const NAME: &'static str = "fetch_page";

    pub fn new(fetcher: Arc<dyn PageFetcher>, retry: RetryPolicy) -> Self {
        Self { fetcher, retry }
    }
}

#[async_trait]
impl Tool for FetchPage {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[tracing::instrument(name = "tool_fetch_page", skip(self, kwargs))]
    async fn call(&self, _flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        let url = required_str(kwargs, keys::URL)?;

        let page = self
            .retry
            .run("fetch", || async {
                let page = self.fetcher.fetch(url).await?;
                // server-side failures are worth another try, client errors are not
                if page.status >= 500 || page.status == 429 {
                    return Err(ExternalServiceError::Http { service: "fetch".into(), status: page.status, body: String::new() });
                }
                Ok::<_, ExternalServiceError>(page)
            })
            .await?;

        if !(200..300).contains(&page.status) {
            return Err(ExternalServiceError::Http {
                service: "fetch".into(),
                status: page.status,
                body: page.body.chars().take(200).collect(),
            }
            .into());
        }

        let text = html_to_text(&page.body);
        if text.is_empty() {
            return Err(StepError::InvalidInput(format!("page {url} has no readable text")));
        }
        info!(%url, status = page.status, chars = text.len(), "page fetched");

        Ok(result([(keys::STATUS_CODE, json!(page.status)), (keys::PAGE_TEXT, json!(text))]))
    }
}
