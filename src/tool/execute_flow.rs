use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    agent::is_rule_code,
    envelope::{FlowKind, MessageBody, keys},
    error::StepError,
    payload::ExtractedEntityPayload,
    store::{ContentStore, ViewStore},
    tool::{Tool, required_str, result},
};

/// The dual-flow tool: RULE materializes a view, CONTENT upserts entities.
///
/// The branch is picked from the flow kind only; the message body never
/// decides which side effect runs.
#[derive(Debug, Clone)]
pub struct ExecuteFlow {
    views: Arc<dyn ViewStore>,
    content: Arc<dyn ContentStore>,
}

/// View name for a rule code: `rule_<code>`.
///
/// Only canonical codes are accepted, which keeps distinct rules on distinct views.
pub fn view_name_for(rule_code: &str) -> Result<String, StepError> {
    let code = rule_code.trim();
    if !is_rule_code(code) {
        return Err(StepError::InvalidInput(format!("`{code}` is not a valid rule code")));
    }
    Ok(format!("rule_{code}"))
}

impl ExecuteFlow {
    pub const NAME: &'static str = "execute_flow";

    pub fn new(views: Arc<dyn ViewStore>, content: Arc<dyn ContentStore>) -> Self {
        Self { views, content }
    }

    async fn run_rule(&self, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        let code = required_str(kwargs, keys::RULE_CODE)?;
        let sql = required_str(kwargs, keys::SQL)?;
        let table_name = view_name_for(code)?;

        let rows = self.views.materialize_view(&table_name, sql).await?;
        info!(view = %table_name, rows, "rule view materialized");

        Ok(result([(keys::TABLE_NAME, json!(table_name)), (keys::ROW_COUNT, json!(rows))]))
    }

    async fn run_content(&self, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        if kwargs.get(keys::PAYLOAD_VERIFIED).and_then(Value::as_bool) != Some(true) {
            return Err(StepError::InvalidInput("payload has not passed verify_upsert".into()));
        }
        let raw = kwargs
            .get(keys::PAYLOAD)
            .cloned()
            .ok_or_else(|| StepError::InvalidInput(format!("missing `{}`", keys::PAYLOAD)))?;
        let payload: ExtractedEntityPayload = serde_json::from_value(raw)
            .map_err(|e| StepError::InvalidInput(format!("payload does not match the entity model: {e}")))?;
        let document = serde_json::to_string(&payload)
            .map_err(|e| StepError::InvalidInput(format!("payload could not be serialized: {e}")))?;

        let summary = self.content.upsert_content(&document).await?;
        info!(%summary, "content upserted");

        Ok(result([
            (keys::STATUS, json!("upserted")),
            (keys::DETAIL, json!(summary.to_string())),
            ("counts", json!(summary)),
        ]))
    }
}

#[async_trait]
impl Tool for ExecuteFlow {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[tracing::instrument(name = "tool_execute_flow", skip(self, kwargs))]
    async fn call(&self, flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        match flow_kind {
            FlowKind::Rule => self.run_rule(kwargs).await,
            FlowKind::Content => self.run_content(kwargs).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn tool() -> (ExecuteFlow, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (ExecuteFlow::new(store.clone(), store.clone()), store)
    }

    #[test]
    fn test_view_name_for() {
        assert_eq!(view_name_for("all_patterns").unwrap(), "rule_all_patterns");
        assert_eq!(view_name_for(" r1 ").unwrap(), "rule_r1");
        assert!(view_name_for("ALL-Patterns").is_err());
        assert!(view_name_for("a-b").is_err());
    }

    #[tokio::test]
    async fn test_rule_branch_materializes_view() {
        let (tool, _store) = tool();
        let kwargs = result([
            (keys::RULE_CODE, json!("all")),
            (keys::SQL, json!("SELECT name FROM patterns")),
            // present but ignored on the RULE branch
            (keys::PAYLOAD, json!({"posts": [{"name": "X"}]})),
        ]);
        let out = tool.call(FlowKind::Rule, &kwargs).await.unwrap();
        assert_eq!(out[keys::TABLE_NAME], json!("rule_all"));
        assert_eq!(out[keys::ROW_COUNT], json!(0));
    }

    #[tokio::test]
    async fn test_content_branch_requires_verified_payload() {
        let (tool, store) = tool();
        let mut kwargs = result([(keys::PAYLOAD, json!({"posts": [{"name": "X"}]}))]);
        let err = tool.call(FlowKind::Content, &kwargs).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(ref m) if m.contains("verify_upsert")));

        kwargs.insert(keys::PAYLOAD_VERIFIED.into(), json!(true));
        let out = tool.call(FlowKind::Content, &kwargs).await.unwrap();
        assert_eq!(out[keys::STATUS], json!("upserted"));
        assert_eq!(out["counts"]["posts"], json!(1));
        assert_eq!(store.content_counts().await.unwrap().posts, 1);
    }
}
