//! Side-effecting operations addressed by name.
//!
//! Tools are the only place the workflow performs I/O. Each one is wrapped in
//! a [`ToolStep`] so the graph can route through it like any agent.

pub mod execute_flow;
pub mod extract_entities;
pub mod fetch_page;
pub mod generate_sql;
pub mod register_rule;

pub use execute_flow::ExecuteFlow;
pub use extract_entities::ExtractEntities;
pub use fetch_page::FetchPage;
pub use generate_sql::GenerateSql;
pub use register_rule::RegisterRule;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::{
    envelope::{FlowKind, MessageBody, Mutation},
    error::{ConfigurationError, StepError},
    step::{Step, StepOutcome},
};

#[async_trait]
pub trait Tool: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Run the tool with the current message body as keyword arguments.
    async fn call(&self, flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError>;
}

#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ConfigurationError> {
        self.tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigurationError::UnregisteredTool(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Look up `name` and call it. An unknown name is a configuration error.
    #[tracing::instrument(name = "execute_tool", skip(self, kwargs))]
    pub async fn execute(&self, name: &str, flow_kind: FlowKind, kwargs: &MessageBody) -> Result<MessageBody, StepError> {
        let tool = self.get(name)?;
        debug!("Tools loaded: {}", self.tools.len());
        tool.call(flow_kind, kwargs).await
    }
}

/// A tool seen as a workflow step: its result map is merged into the body.
#[derive(Debug, Clone)]
pub struct ToolStep {
    tool: Arc<dyn Tool>,
}

impl ToolStep {
    /// Resolve `name` now so a missing tool fails at startup, not mid-request.
    pub fn resolve(registry: &ToolRegistry, name: &str) -> Result<Self, ConfigurationError> {
        Ok(Self { tool: registry.get(name)? })
    }
}

#[async_trait]
impl Step for ToolStep {
    fn name(&self) -> &str {
        self.tool.name()
    }

    async fn process(&self, body: &MessageBody, flow_kind: FlowKind) -> Result<StepOutcome, StepError> {
        let result = self.tool.call(flow_kind, body).await?;
        let keys = result.keys().cloned().collect::<Vec<_>>().join(", ");
        Ok(StepOutcome::yes(format!("{} returned {{{keys}}}", self.tool.name()))
            .with_mutations(result.into_iter().map(|(key, value)| Mutation::Set { key, value })))
    }
}

pub(crate) fn required_str<'a>(kwargs: &'a MessageBody, key: &str) -> Result<&'a str, StepError> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StepError::InvalidInput(format!("missing `{key}`")))
}

pub(crate) fn optional_str<'a>(kwargs: &'a MessageBody, key: &str) -> Option<&'a str> {
    kwargs.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// Build a result map from key/value pairs.
pub(crate) fn result<const N: usize>(pairs: [(&str, Value); N]) -> MessageBody {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
