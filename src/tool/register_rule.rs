use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    envelope::{FlowKind, MessageBody, keys},
    error::StepError,
    store::{RegistryStore, StoreError, ViewStore},
    tool::{Tool, execute_flow::view_name_for, optional_str, required_str, result},
};

/// Records the compiled rule and its view in the registry.
///
/// The view already exists when this runs. If registration fails and no
/// earlier registration owns the view, it is dropped again.
#[derive(Debug, Clone)]
pub struct RegisterRule {
    registry: Arc<dyn RegistryStore>,
    views: Arc<dyn ViewStore>,
}

impl RegisterRule {
    pub const NAME: &'static str = "register_rule";

    pub fn new(registry: Arc<dyn RegistryStore>, views: Arc<dyn ViewStore>) -> Self {
        Self { registry, views }
    }

    async fn register(
        &self,
        code: &str,
        name: &str,
        description: &str,
        sql: &str,
        table_name: &str,
        summary: &str,
    ) -> Result<(i64, i64), StoreError> {
        let rule_id = self.registry.upsert_rule(code, name, description, sql).await?;
        let view_id = self.registry.upsert_view(table_name, rule_id, summary).await?;
        Ok((rule_id, view_id))
    }

    async fn discard_unregistered_view(&self, table_name: &str) {
        match self.registry.view_by_table(table_name).await {
            Ok(Some(_)) => {}
            Ok(None) => match self.views.drop_view(table_name).await {
                Ok(_) => warn!(view = %table_name, "dropped view whose registration failed"),
                Err(e) => warn!(view = %table_name, "could not drop unregistered view: {e}"),
            },
            Err(e) => warn!(view = %table_name, "could not check view registration: {e}"),
        }
    }
}

#[async_trait]
impl Tool for RegisterRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[tracing::instrument(name = "tool_register_rule", skip(self, kwargs))]
    async fn call(&self, flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        if flow_kind != FlowKind::Rule {
            return Err(StepError::InvalidInput(format!("{} only applies to RULE requests", Self::NAME)));
        }
        let code = required_str(kwargs, keys::RULE_CODE)?;
        let sql = required_str(kwargs, keys::SQL)?;
        let table_name = required_str(kwargs, keys::TABLE_NAME)?;
        if table_name != view_name_for(code)? {
            return Err(StepError::InvalidInput(format!("view `{table_name}` does not belong to rule `{code}`")));
        }
        let name = optional_str(kwargs, keys::RULE_NAME).unwrap_or(code);
        let description = optional_str(kwargs, keys::RULE_DESCRIPTION).unwrap_or_default();

        let summary = match kwargs.get(keys::ROW_COUNT).and_then(Value::as_u64) {
            Some(rows) => format!("{name}: {rows} rows"),
            None => name.to_string(),
        };

        let (rule_id, view_id) = match self.register(code, name, description, sql, table_name, &summary).await {
            Ok(ids) => ids,
            Err(err) => {
                self.discard_unregistered_view(table_name).await;
                return Err(err.into());
            }
        };
        info!(rule_code = %code, rule_id, view_id, "rule registered");

        Ok(result([(keys::RULE_ID, json!(rule_id)), (keys::VIEW_ID, json!(view_id))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Rule, SqliteStore, ViewRegistryEntry};

    fn kwargs(sql: &str) -> MessageBody {
        result([
            (keys::RULE_CODE, json!("all")),
            (keys::RULE_NAME, json!("All patterns")),
            (keys::SQL, json!(sql)),
            (keys::TABLE_NAME, json!("rule_all")),
            (keys::ROW_COUNT, json!(3)),
        ])
    }

    fn tool(store: &Arc<SqliteStore>) -> RegisterRule {
        RegisterRule::new(store.clone(), store.clone())
    }

    /// Accepts the rule but cannot write the view row.
    #[derive(Debug)]
    struct ViewRowsUnavailable;

    #[async_trait]
    impl RegistryStore for ViewRowsUnavailable {
        async fn upsert_rule(&self, _: &str, _: &str, _: &str, _: &str) -> Result<i64, StoreError> {
            Ok(1)
        }

        async fn upsert_view(&self, _: &str, _: i64, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        async fn rule_by_code(&self, _: &str) -> Result<Option<Rule>, StoreError> {
            Ok(None)
        }

        async fn view_by_table(&self, _: &str) -> Result<Option<ViewRegistryEntry>, StoreError> {
            Ok(None)
        }

        async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
            Ok(vec![])
        }

        async fn list_views(&self) -> Result<Vec<ViewRegistryEntry>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_reregistering_updates_in_place() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tool = tool(&store);

        let first = tool.call(FlowKind::Rule, &kwargs("SELECT 1")).await.unwrap();
        let second = tool.call(FlowKind::Rule, &kwargs("SELECT 2")).await.unwrap();
        assert_eq!(first, second);

        let rule = store.rule_by_code("all").await.unwrap().unwrap();
        assert_eq!(rule.sql, "SELECT 2");
        let view = store.view_by_table("rule_all").await.unwrap().unwrap();
        assert_eq!(view.rule_id, rule.id);
        assert_eq!(view.summary, "All patterns: 3 rows");
    }

    #[tokio::test]
    async fn test_rejects_content_requests() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let err = tool(&store).call(FlowKind::Content, &kwargs("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_view_must_belong_to_the_rule() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut args = kwargs("SELECT 1");
        args.insert(keys::TABLE_NAME.into(), json!("rule_other"));
        let err = tool(&store).call(FlowKind::Rule, &args).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(ref m) if m.contains("does not belong")));
        assert!(store.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_drops_the_new_view() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.materialize_view("rule_all", "SELECT 1").await.unwrap();
        let tool = RegisterRule::new(Arc::new(ViewRowsUnavailable), store.clone());

        let err = tool.call(FlowKind::Rule, &kwargs("SELECT 1")).await.unwrap_err();

        assert!(matches!(err, StepError::External(_)), "{err}");
        // already gone
        assert!(!store.drop_view("rule_all").await.unwrap());
    }

    #[tokio::test]
    async fn test_registered_view_is_never_discarded() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.materialize_view("rule_all", "SELECT 1").await.unwrap();
        let tool = tool(&store);
        tool.call(FlowKind::Rule, &kwargs("SELECT 1")).await.unwrap();

        tool.discard_unregistered_view("rule_all").await;

        assert!(store.view_by_table("rule_all").await.unwrap().is_some());
        assert!(store.drop_view("rule_all").await.unwrap());
    }
}
