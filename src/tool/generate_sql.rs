use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    context::{ContextBuilder, PromptContext},
    envelope::{FlowKind, MessageBody, keys},
    error::{ExternalServiceError, StepError},
    llm::{Completion, parse_json_reply, strip_code_fence},
    retry::RetryPolicy,
    tool::{Tool, required_str, result},
};

/// Compiles rule text into SQL through the LLM.
#[derive(Debug, Clone)]
pub struct GenerateSql {
    context: ContextBuilder,
    llm: Arc<dyn Completion>,
    retry: RetryPolicy,
    cache: Cache<PromptContext, String>,
}

impl GenerateSql {
    pub const NAME: &'static str = "generate_sql";

    pub fn new(context: ContextBuilder, llm: Arc<dyn Completion>, retry: RetryPolicy, cache_ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1_024).time_to_live(cache_ttl).build();
        Self { context, llm, retry, cache }
    }
}

/// SQL out of an untrusted completion: raw text, a fenced block, or `{"sql": ...}`.
pub fn parse_sql_reply(service: &str, text: &str) -> Result<String, ExternalServiceError> {
    let body = strip_code_fence(text);
    let sql = if body.starts_with('{') {
        let value = parse_json_reply(service, body)?;
        value
            .get("sql")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExternalServiceError::MalformedResponse {
                service: service.to_string(),
                message: "JSON reply has no `sql` string".into(),
            })?
    } else {
        body.to_string()
    };

    let sql = sql.trim().to_string();
    if sql.is_empty() {
        return Err(ExternalServiceError::MalformedResponse {
            service: service.to_string(),
            message: "completion contained no SQL".into(),
        });
    }
    Ok(sql)
}

#[async_trait]
impl Tool for GenerateSql {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[tracing::instrument(name = "tool_generate_sql", skip(self, kwargs))]
    async fn call(&self, _flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        let text = required_str(kwargs, keys::RULE_TEXT)?;
        let prompt = self.context.build_context(text);

        if let Some(sql) = self.cache.get(&prompt).await {
            debug!("sql cache hit");
            return Ok(result([(keys::SQL, json!(sql))]));
        }

        let reply = self.retry.run(self.llm.name(), || self.llm.complete(&prompt)).await?;
        let sql = parse_sql_reply(self.llm.name(), &reply)?;
        info!(provider = self.llm.name(), "sql generated");
        self.cache.insert(prompt, sql.clone()).await;

        Ok(result([(keys::SQL, json!(sql))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Specification;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Completion for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, prompt: &PromptContext) -> Result<String, ExternalServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("```sql\nSELECT * FROM patterns -- {}\n```", prompt.user))
        }
    }

    fn builder() -> ContextBuilder {
        let mut schema = BTreeMap::new();
        schema.insert("patterns".to_string(), vec!["id".to_string(), "name".to_string()]);
        ContextBuilder::new(Arc::new(Specification { instructions: "Write SQL.".into(), schema, denylist: None }))
    }

    #[test]
    fn test_parse_sql_reply_variants() {
        assert_eq!(parse_sql_reply("t", "SELECT 1").unwrap(), "SELECT 1");
        assert_eq!(parse_sql_reply("t", "```sql\nSELECT 2;\n```").unwrap(), "SELECT 2;");
        assert_eq!(parse_sql_reply("t", r#"{"sql": "SELECT 3"}"#).unwrap(), "SELECT 3");
        assert!(parse_sql_reply("t", r#"{"query": "SELECT 4"}"#).is_err());
        assert!(parse_sql_reply("t", "   ").is_err());
    }

    #[tokio::test]
    async fn test_identical_prompts_hit_the_cache() {
        let llm = Arc::new(Counting::default());
        let tool = GenerateSql::new(builder(), llm.clone(), RetryPolicy::none(), Duration::from_secs(60));
        let kwargs = result([(keys::RULE_TEXT, json!("Find all patterns"))]);

        let first = tool.call(FlowKind::Rule, &kwargs).await.unwrap();
        let second = tool.call(FlowKind::Rule, &kwargs).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert!(first[keys::SQL].as_str().unwrap().starts_with("SELECT * FROM patterns"));
    }
}
