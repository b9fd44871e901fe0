// src/step.rs

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    envelope::{Decision, FlowKind, MessageBody, Mutation},
    error::{ConfigurationError, StepError},
};

/// What a step hands back to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub decision: Decision,
    pub confidence: f64,
    pub reason: String,
    pub mutations: Vec<Mutation>,
}

impl StepOutcome {
    pub fn yes(reason: impl Into<String>) -> Self {
        Self { decision: Decision::Yes, confidence: 1.0, reason: reason.into(), mutations: vec![] }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self { decision: Decision::No, confidence: 1.0, reason: reason.into(), mutations: vec![] }
    }

    pub fn pending(reason: impl Into<String>) -> Self {
        Self { decision: Decision::Pending, confidence: 0.0, reason: reason.into(), mutations: vec![] }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_mutation(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn with_mutations(mut self, mutations: impl IntoIterator<Item = Mutation>) -> Self {
        self.mutations.extend(mutations);
        self
    }
}

/// A validation agent or a tool, addressed by name from the workflow graph.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn process(&self, body: &MessageBody, flow_kind: FlowKind) -> Result<StepOutcome, StepError>;
}

/// Name -> step lookup, filled once at startup.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: Arc<DashMap<String, Arc<dyn Step>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step: Arc<dyn Step>) {
        let name = step.name().to_string();
        if self.steps.insert(name.clone(), step).is_some() {
            tracing::warn!(step = %name, "step registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Step>, ConfigurationError> {
        self.steps
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigurationError::UnregisteredStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
