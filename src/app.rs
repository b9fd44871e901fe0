// src/app.rs
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    agent::{Denylist, VerifyRequest, VerifySql, VerifyUpsert},
    config::{LlmProvider, Settings},
    context::{ContextBuilder, Specification, install_specification},
    error::SupervisorError,
    fetch::{HttpFetcher, PageFetcher},
    flow::{Supervisor, SupervisorOptions, WorkflowGraph},
    llm::{Completion, OllamaCompletion, OpenAiCompletion, ollama, openai},
    retry::RetryPolicy,
    step::StepRegistry,
    store::SqliteStore,
    tool::{ExecuteFlow, ExtractEntities, FetchPage, GenerateSql, RegisterRule, ToolRegistry, ToolStep},
};

/// Every step `App::assemble` registers, agents first.
pub const STEP_NAMES: [&str; 8] = [
    VerifyRequest::NAME,
    VerifySql::NAME,
    VerifyUpsert::NAME,
    GenerateSql::NAME,
    FetchPage::NAME,
    ExtractEntities::NAME,
    ExecuteFlow::NAME,
    RegisterRule::NAME,
];

/// Everything the supervisor is built from. Tests fill this with fakes.
pub struct AppParts {
    pub specification: Arc<Specification>,
    pub llm: Arc<dyn Completion>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub store: Arc<SqliteStore>,
    pub graph: Arc<WorkflowGraph>,
    pub retry: RetryPolicy,
    pub sql_cache_ttl: Duration,
    pub options: SupervisorOptions,
}

pub struct App {
    supervisor: Supervisor,
    store: Arc<SqliteStore>,
    context: ContextBuilder,
    tools: ToolRegistry,
}

impl App {
    /// Wire agents, tools and the graph into a supervisor.
    ///
    /// Fails when the graph references a step that is not registered here.
    pub fn assemble(parts: AppParts) -> Result<Self, SupervisorError> {
        let denylist = Arc::new(Denylist::from_specification(&parts.specification)?);
        let context = ContextBuilder::new(parts.specification.clone());

        let tools = ToolRegistry::new();
        tools.register(Arc::new(GenerateSql::new(
            context.clone(),
            parts.llm.clone(),
            parts.retry,
            parts.sql_cache_ttl,
        )));
        tools.register(Arc::new(FetchPage::new(parts.fetcher, parts.retry)));
        tools.register(Arc::new(ExtractEntities::new(parts.llm, parts.retry)));
        tools.register(Arc::new(ExecuteFlow::new(parts.store.clone(), parts.store.clone())));
        tools.register(Arc::new(RegisterRule::new(parts.store.clone(), parts.store.clone())));

        let steps = StepRegistry::new();
        steps.register(Arc::new(VerifyRequest));
        steps.register(Arc::new(VerifySql::new(denylist.clone())));
        steps.register(Arc::new(VerifyUpsert::new(denylist)));
        for name in tools.names() {
            steps.register(Arc::new(ToolStep::resolve(&tools, &name)?));
        }

        let supervisor = Supervisor::new(parts.graph, steps, parts.options)?;
        info!(routes = supervisor.graph().definition().routes.len(), tools = tools.names().len(), "supervisor assembled");
        Ok(Self { supervisor, store: parts.store, context, tools })
    }

    /// Build the production wiring from settings.
    pub async fn bootstrap(settings: &Settings) -> Result<Self> {
        let specification = match &settings.specification_path {
            Some(path) => Specification::load(path)?,
            None => Specification::bundled()?,
        };
        let specification = install_specification(specification);

        let llm: Arc<dyn Completion> = match settings.llm_provider {
            LlmProvider::OpenAi => Arc::new(OpenAiCompletion::new(
                settings.openai_url.as_deref().unwrap_or(openai::DEFAULT_URL),
                settings.openai_key.as_deref().unwrap_or_default(),
                settings.openai_model.as_deref().unwrap_or(openai::DEFAULT_MODEL),
                settings.request_timeout,
            )?),
            LlmProvider::Ollama => Arc::new(OllamaCompletion::new(
                settings.ollama_url.as_deref(),
                settings.ollama_model.as_deref().unwrap_or(ollama::DEFAULT_MODEL),
            )?),
        };

        let store = SqliteStore::open(&settings.database_path)
            .with_context(|| format!("opening database {}", settings.database_path.display()))?;
        let graph = match &settings.workflow_path {
            Some(path) => WorkflowGraph::load(path)?,
            None => WorkflowGraph::standard(),
        };

        let app = Self::assemble(AppParts {
            specification,
            llm,
            fetcher: Arc::new(HttpFetcher::new(settings.fetch_timeout)?),
            store: Arc::new(store),
            graph: Arc::new(graph),
            retry: RetryPolicy::new(settings.retry_max_attempts, settings.retry_base_delay),
            sql_cache_ttl: settings.sql_cache_ttl,
            options: SupervisorOptions { hop_limit: settings.hop_limit, timeout: settings.request_timeout },
        })?;
        Ok(app)
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}
