// src/flow/supervisor.rs

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    envelope::{Decision, Envelope, FlowKind, MessageBody, keys},
    error::{StepError, SupervisorError},
    flow::graph::WorkflowGraph,
    logger::RequestMetrics,
    step::{StepOutcome, StepRegistry},
};

pub const DEFAULT_HOP_LIMIT: usize = 32;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Step invocations allowed per request.
    pub hop_limit: usize,
    /// Wall-clock budget for a whole request.
    pub timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self { hop_limit: DEFAULT_HOP_LIMIT, timeout: DEFAULT_TIMEOUT }
    }
}

/// An incoming request before it has an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub flow_kind: FlowKind,
    pub verb: String,
    pub body: MessageBody,
}

impl Request {
    pub fn new(flow_kind: FlowKind, verb: impl Into<String>, body: MessageBody) -> Self {
        Self { flow_kind, verb: verb.into(), body }
    }

    /// Compile a natural-language rule into a view.
    pub fn rule(code: &str, name: &str, description: &str, text: &str) -> Self {
        let mut body = MessageBody::new();
        body.insert(keys::RULE_CODE.into(), json!(code));
        body.insert(keys::RULE_NAME.into(), json!(name));
        body.insert(keys::RULE_DESCRIPTION.into(), json!(description));
        body.insert(keys::RULE_TEXT.into(), json!(text));
        Self::new(FlowKind::Rule, "compile", body)
    }

    /// Ingest the entities found on one web page.
    pub fn content(url: &str) -> Self {
        let mut body = MessageBody::new();
        body.insert(keys::URL.into(), json!(url));
        Self::new(FlowKind::Content, "ingest", body)
    }
}

/// One record per step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub hop: usize,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub decision: Decision,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub request_id: String,
    pub envelope: Envelope,
    /// The terminal step the request stopped at.
    pub terminal: String,
    pub hops: usize,
    pub records: Vec<StepRecord>,
    pub total_ms: i64,
    pub(crate) success: bool,
}

impl FinalResult {
    /// True when the request reached the graph's success terminal.
    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Drives one envelope through the workflow graph until a terminal step.
#[derive(Debug, Clone)]
pub struct Supervisor {
    graph: Arc<WorkflowGraph>,
    steps: StepRegistry,
    options: SupervisorOptions,
    metrics: RequestMetrics,
}

impl Supervisor {
    /// Fails when the graph names a step nobody registered or leaves a decision unrouted.
    pub fn new(graph: Arc<WorkflowGraph>, steps: StepRegistry, options: SupervisorOptions) -> Result<Self, SupervisorError> {
        graph.validate(&steps.names())?;
        if graph.has_cycle() {
            warn!(hop_limit = options.hop_limit, "workflow graph has a cycle; requests rely on the hop limit");
        }
        Ok(Self { graph, steps, options, metrics: RequestMetrics::new() })
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn options(&self) -> SupervisorOptions {
        self.options
    }

    /// Run a request to completion.
    ///
    /// Step failures are recorded on the envelope and routed to the error sink,
    /// so they still produce an `Ok` result. Only misconfiguration, the hop
    /// limit and the request timeout surface as errors.
    #[tracing::instrument(name = "supervisor_process", skip(self, request), fields(flow_kind = %request.flow_kind, verb = %request.verb))]
    pub async fn process(&self, request: Request) -> Result<FinalResult, SupervisorError> {
        let request_id = Uuid::new_v4().to_string();
        let flow_kind = request.flow_kind;
        self.metrics.started(flow_kind);
        let start = Instant::now();

        let result = match timeout(self.options.timeout, self.run(&request_id, request)).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Timeout { millis: self.options.timeout.as_millis() as u64 }),
        };

        self.metrics.finish(&request_id, flow_kind, &result, start.elapsed());
        result
    }

    async fn run(&self, request_id: &str, request: Request) -> Result<FinalResult, SupervisorError> {
        let run_start = Utc::now();
        let flow_kind = request.flow_kind;
        let entry = self.graph.entry(flow_kind)?;
        let mut envelope = Envelope::new(flow_kind, request.verb, entry, request.body);
        let mut records = Vec::new();
        let mut hops = 0;

        while !self.graph.is_terminal(envelope.next_step()) {
            let step_name = envelope.next_step().to_string();
            if hops >= self.options.hop_limit {
                return Err(SupervisorError::HopLimitExceeded { limit: self.options.hop_limit, last_step: step_name });
            }
            hops += 1;

            let step = self.steps.get(&step_name)?;
            let started = Utc::now();
            let outcome = match step.process(envelope.message_body(), flow_kind).await {
                Ok(outcome) => outcome,
                Err(StepError::Configuration(err)) => return Err(err.into()),
                Err(err) => {
                    warn!(%request_id, step = %step_name, error = %err, "step failed");
                    StepOutcome::no(format!("{step_name} failed: {err}")).with_confidence(0.0)
                }
            };
            let finished = Utc::now();

            let next = self.graph.next(&step_name, outcome.decision, flow_kind)?.to_string();
            debug!(%request_id, step = %step_name, decision = %outcome.decision, %next, "routed");

            records.push(StepRecord {
                step: step_name,
                hop: hops,
                started,
                finished,
                decision: outcome.decision,
                reason: outcome.reason.clone(),
            });
            envelope = envelope
                .with_outcome(outcome.decision, outcome.confidence, outcome.reason, &outcome.mutations)
                .routed_to(next);
        }

        let terminal = envelope.next_step().to_string();
        let success = terminal == self.graph.success() && envelope.decision() == Decision::Yes;
        info!(%request_id, %terminal, hops, success, "request finished");

        Ok(FinalResult {
            request_id: request_id.to_string(),
            envelope,
            terminal,
            hops,
            records,
            total_ms: (Utc::now() - run_start).num_milliseconds(),
            success,
        })
    }
}
