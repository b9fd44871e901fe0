#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ruleflow::{
    app::{App, AppParts},
    context::{PromptContext, Specification},
    error::ExternalServiceError,
    fetch::{FetchedPage, PageFetcher},
    flow::{SupervisorOptions, WorkflowGraph},
    llm::Completion,
    retry::RetryPolicy,
    store::SqliteStore,
};
use serde_json::{Value, json};

pub const PATTERNS_SQL: &str = "SELECT name, kind FROM patterns WHERE kind = 'pattern'";

/// Replies with canned text: entity JSON for extraction prompts, SQL otherwise.
#[derive(Debug)]
pub struct CannedCompletion {
    pub sql: String,
    pub entities: String,
    pub delay: Duration,
    calls: AtomicUsize,
}

impl CannedCompletion {
    pub fn new(sql: &str, entities: &Value) -> Self {
        Self { sql: sql.to_string(), entities: entities.to_string(), delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Completion for CannedCompletion {
    fn name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, prompt: &PromptContext) -> Result<String, ExternalServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if prompt.system.contains("JSON Schema:") {
            Ok(format!("```json\n{}\n```", self.entities))
        } else {
            Ok(self.sql.clone())
        }
    }
}

/// Serves the same page for every URL.
#[derive(Debug, Clone)]
pub struct CannedFetcher {
    pub status: u16,
    pub body: String,
}

impl CannedFetcher {
    pub fn ok(body: &str) -> Self {
        Self { status: 200, body: body.to_string() }
    }
}

#[async_trait]
impl PageFetcher for CannedFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchedPage, ExternalServiceError> {
        Ok(FetchedPage { status: self.status, body: self.body.clone() })
    }
}

pub const PAGE: &str = "<html><head><title>Episode 12</title><script>track()</script></head>\
<body><h1>Episode 12: Strangler Fig</h1><p>We talk about the Strangler Fig pattern.</p></body></html>";

/// Scenario B: one post, one pattern, one link between them.
pub fn valid_payload() -> Value {
    json!({
        "posts": [{"name": "X"}],
        "organizations": [],
        "guests": [],
        "patterns": [{"name": "P", "kind": "pattern"}],
        "pattern_post_link": [{"pattern_name": "P", "post_name": "X"}],
        "pattern_org_link": [],
        "pattern_guest_link": []
    })
}

/// Scenario C: the link names a post that is not in the payload.
pub fn orphan_payload() -> Value {
    let mut payload = valid_payload();
    payload["pattern_post_link"][0]["post_name"] = json!("Y");
    payload
}

pub struct Harness {
    pub app: App,
    pub store: Arc<SqliteStore>,
    pub llm: Arc<CannedCompletion>,
}

pub fn harness(llm: CannedCompletion, fetcher: CannedFetcher) -> Harness {
    harness_with(llm, fetcher, WorkflowGraph::standard(), SupervisorOptions::default())
}

pub fn harness_with(llm: CannedCompletion, fetcher: CannedFetcher, graph: WorkflowGraph, options: SupervisorOptions) -> Harness {
    assemble(Specification::bundled().unwrap(), llm, fetcher, graph, options)
}

/// Standard graph over a caller-supplied specification.
pub fn harness_with_specification(specification: Specification, llm: CannedCompletion, fetcher: CannedFetcher) -> Harness {
    assemble(specification, llm, fetcher, WorkflowGraph::standard(), SupervisorOptions::default())
}

fn assemble(
    specification: Specification,
    llm: CannedCompletion,
    fetcher: CannedFetcher,
    graph: WorkflowGraph,
    options: SupervisorOptions,
) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let llm = Arc::new(llm);
    let app = App::assemble(AppParts {
        specification: Arc::new(specification),
        llm: llm.clone(),
        fetcher: Arc::new(fetcher),
        store: store.clone(),
        graph: Arc::new(graph),
        retry: RetryPolicy::none(),
        sql_cache_ttl: Duration::from_secs(60),
        options,
    })
    .unwrap();
    Harness { app, store, llm }
}
