// src/flow/graph.rs

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs,
    path::Path,
};

use petgraph::graph::{DiGraph, NodeIndex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    envelope::{Decision, FlowKind},
    error::ConfigurationError,
};

pub const DONE: &str = "done";
pub const HUMAN_REVIEW: &str = "human_review";

/// Which decisions a route fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMatch {
    Yes,
    No,
    Pending,
    Any,
}

impl DecisionMatch {
    pub fn matches(&self, decision: Decision) -> bool {
        match self {
            DecisionMatch::Any => true,
            DecisionMatch::Yes => decision == Decision::Yes,
            DecisionMatch::No => decision == Decision::No,
            DecisionMatch::Pending => decision == Decision::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteDefinition {
    pub step: String,
    /// Restrict the route to one flow kind. Absent means both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowKind>,
    pub on: DecisionMatch,
    pub next: String,
}

/// Serializable form of a workflow graph (YAML or JSON on disk).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    pub entry: BTreeMap<FlowKind, String>,
    pub terminals: Vec<String>,
    pub success: String,
    pub error_sink: String,
    /// Evaluated in declaration order; the first matching route wins.
    pub routes: Vec<RouteDefinition>,
}

impl GraphDefinition {
    /// The built-in RULE and CONTENT pipelines; every `no` goes to human review.
    pub fn standard() -> Self {
        let rule = ["verify_request", "generate_sql", "verify_sql", "execute_flow", "register_rule", DONE];
        let content = ["verify_request", "fetch_page", "extract_entities", "verify_upsert", "execute_flow", DONE];

        let mut routes = vec![];
        for (flow, chain) in [(FlowKind::Rule, &rule), (FlowKind::Content, &content)] {
            for pair in chain.windows(2) {
                routes.push(RouteDefinition {
                    step: pair[0].to_string(),
                    flow: Some(flow),
                    on: DecisionMatch::Yes,
                    next: pair[1].to_string(),
                });
            }
        }
        let steps: BTreeSet<&str> = rule.iter().chain(content.iter()).copied().filter(|s| *s != DONE).collect();
        for step in steps {
            routes.push(RouteDefinition {
                step: step.to_string(),
                flow: None,
                on: DecisionMatch::No,
                next: HUMAN_REVIEW.to_string(),
            });
        }

        Self {
            entry: BTreeMap::from([
                (FlowKind::Rule, "verify_request".to_string()),
                (FlowKind::Content, "verify_request".to_string()),
            ]),
            terminals: vec![DONE.to_string(), HUMAN_REVIEW.to_string()],
            success: DONE.to_string(),
            error_sink: HUMAN_REVIEW.to_string(),
            routes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    when: DecisionMatch,
    next: String,
}

/// Static routing table: `(step, decision, flow kind) -> next step`.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: GraphDefinition,
    terminals: HashSet<String>,
    routes: HashMap<(String, FlowKind), Vec<Route>>,
}

impl WorkflowGraph {
    pub fn standard() -> Self {
        Self::build(GraphDefinition::standard())
    }

    /// Check the definition's shape and build the routing table.
    pub fn from_definition(definition: GraphDefinition) -> Result<Self, ConfigurationError> {
        let mut problems = vec![];

        for kind in FlowKind::ALL {
            match definition.entry.get(&kind) {
                Some(step) if !step.trim().is_empty() => {}
                _ => problems.push(format!("no entry step for {kind}")),
            }
        }
        let terminals: HashSet<&str> = definition.terminals.iter().map(String::as_str).collect();
        if !terminals.contains(definition.success.as_str()) {
            problems.push(format!("success step `{}` is not a terminal", definition.success));
        }
        if !terminals.contains(definition.error_sink.as_str()) {
            problems.push(format!("error sink `{}` is not a terminal", definition.error_sink));
        }
        for (i, route) in definition.routes.iter().enumerate() {
            if route.step.trim().is_empty() || route.next.trim().is_empty() {
                problems.push(format!("route {i} has an empty step name"));
            }
            if terminals.contains(route.step.as_str()) {
                problems.push(format!("route {i} leaves terminal `{}`", route.step));
            }
        }

        if problems.is_empty() {
            Ok(Self::build(definition))
        } else {
            Err(ConfigurationError::InvalidGraph(problems.join("; ")))
        }
    }

    /// Load a definition from YAML, or JSON when the extension says so.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigurationError::InvalidGraph(format!("{}: {e}", path.display())))?;
        let definition: GraphDefinition = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| ConfigurationError::InvalidGraph(format!("{}: {e}", path.display())))?,
            _ => serde_yaml_bw::from_str(&raw)
                .map_err(|e| ConfigurationError::InvalidGraph(format!("{}: {e}", path.display())))?,
        };
        let graph = Self::from_definition(definition)?;
        info!(path = %path.display(), routes = graph.definition.routes.len(), "workflow graph loaded");
        Ok(graph)
    }

    fn build(definition: GraphDefinition) -> Self {
        let terminals = definition.terminals.iter().cloned().collect();
        let mut routes: HashMap<(String, FlowKind), Vec<Route>> = HashMap::new();
        for def in &definition.routes {
            let kinds = match def.flow {
                Some(kind) => vec![kind],
                None => FlowKind::ALL.to_vec(),
            };
            for kind in kinds {
                routes
                    .entry((def.step.clone(), kind))
                    .or_default()
                    .push(Route { when: def.on, next: def.next.clone() });
            }
        }
        Self { definition, terminals, routes }
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    pub fn entry(&self, flow_kind: FlowKind) -> Result<&str, ConfigurationError> {
        self.definition
            .entry
            .get(&flow_kind)
            .map(String::as_str)
            .ok_or(ConfigurationError::MissingEntry(flow_kind))
    }

    pub fn is_terminal(&self, step: &str) -> bool {
        self.terminals.contains(step)
    }

    pub fn success(&self) -> &str {
        &self.definition.success
    }

    pub fn error_sink(&self) -> &str {
        &self.definition.error_sink
    }

    /// The step after `step` for this decision. No matching route is a configuration error.
    pub fn next(&self, step: &str, decision: Decision, flow_kind: FlowKind) -> Result<&str, ConfigurationError> {
        self.routes
            .get(&(step.to_string(), flow_kind))
            .and_then(|routes| routes.iter().find(|r| r.when.matches(decision)))
            .map(|r| r.next.as_str())
            .ok_or_else(|| ConfigurationError::UnresolvedRoute { step: step.to_string(), decision, flow_kind })
    }

    /// Non-terminal steps reachable from the entry of `flow_kind`, in visit order.
    pub fn reachable(&self, flow_kind: FlowKind) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = vec![];
        let mut stack: Vec<String> = self.definition.entry.get(&flow_kind).cloned().into_iter().collect();
        while let Some(step) = stack.pop() {
            if self.is_terminal(&step) || !seen.insert(step.clone()) {
                continue;
            }
            if let Some(routes) = self.routes.get(&(step.clone(), flow_kind)) {
                for r in routes.iter().rev() {
                    stack.push(r.next.clone());
                }
            }
            order.push(step);
        }
        order
    }

    /// Every reachable step must be known and resolve both `yes` and `no`.
    /// All problems are reported in one error.
    pub fn validate<S: AsRef<str>>(&self, known_steps: &[S]) -> Result<(), ConfigurationError> {
        let known: HashSet<&str> = known_steps.iter().map(AsRef::as_ref).collect();
        let mut problems = BTreeSet::new();

        for kind in FlowKind::ALL {
            for step in self.reachable(kind) {
                if !known.contains(step.as_str()) {
                    problems.insert(format!("unknown step `{step}`"));
                }
                for decision in [Decision::Yes, Decision::No] {
                    if self.next(&step, decision, kind).is_err() {
                        problems.insert(format!("no route from `{step}` on `{decision}` for {kind}"));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidGraph(problems.into_iter().collect::<Vec<_>>().join("; ")))
        }
    }

    /// True when some route chain can revisit a step. The hop limit still bounds such graphs at runtime.
    pub fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for route in &self.definition.routes {
            let mut ends = [NodeIndex::end(); 2];
            for (slot, name) in ends.iter_mut().zip([route.step.as_str(), route.next.as_str()]) {
                *slot = *index_of.entry(name).or_insert_with(|| graph.add_node(name));
            }
            graph.add_edge(ends[0], ends[1], ());
        }
        petgraph::algo::is_cyclic_directed(&graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: [&str; 8] = [
        "verify_request",
        "generate_sql",
        "verify_sql",
        "execute_flow",
        "register_rule",
        "fetch_page",
        "extract_entities",
        "verify_upsert",
    ];

    #[test]
    fn test_standard_graph_routes() {
        let g = WorkflowGraph::standard();
        assert_eq!(g.next("verify_request", Decision::Yes, FlowKind::Rule).unwrap(), "generate_sql");
        assert_eq!(g.next("verify_request", Decision::Yes, FlowKind::Content).unwrap(), "fetch_page");
        assert_eq!(g.next("execute_flow", Decision::Yes, FlowKind::Rule).unwrap(), "register_rule");
        assert_eq!(g.next("execute_flow", Decision::Yes, FlowKind::Content).unwrap(), DONE);
        assert_eq!(g.next("verify_upsert", Decision::No, FlowKind::Content).unwrap(), HUMAN_REVIEW);
        assert!(g.validate(&STEPS).is_ok());
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_routing_is_deterministic() {
        let g = WorkflowGraph::standard();
        let first = g.next("verify_sql", Decision::Yes, FlowKind::Rule).unwrap().to_string();
        for _ in 0..100 {
            assert_eq!(g.next("verify_sql", Decision::Yes, FlowKind::Rule).unwrap(), first);
        }
    }

    #[test]
    fn test_unresolved_route_is_configuration_error() {
        let g = WorkflowGraph::standard();
        let err = g.next("verify_request", Decision::Pending, FlowKind::Rule).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnresolvedRoute {
                step: "verify_request".into(),
                decision: Decision::Pending,
                flow_kind: FlowKind::Rule
            }
        );
        assert!(g.next("generate_sql", Decision::Yes, FlowKind::Content).is_err());
    }

    #[test]
    fn test_first_matching_route_wins() {
        let mut def = GraphDefinition::standard();
        def.routes.insert(
            0,
            RouteDefinition { step: "verify_request".into(), flow: None, on: DecisionMatch::Any, next: HUMAN_REVIEW.into() },
        );
        let g = WorkflowGraph::from_definition(def).unwrap();
        assert_eq!(g.next("verify_request", Decision::Yes, FlowKind::Rule).unwrap(), HUMAN_REVIEW);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut def = GraphDefinition::standard();
        def.routes.retain(|r| !(r.step == "verify_sql" && r.on == DecisionMatch::No));
        let g = WorkflowGraph::from_definition(def).unwrap();

        let err = g.validate(&["verify_request", "generate_sql"]).unwrap_err().to_string();
        assert!(err.contains("unknown step `verify_sql`"));
        assert!(err.contains("unknown step `fetch_page`"));
        assert!(err.contains("no route from `verify_sql` on `no` for RULE"));
    }

    #[test]
    fn test_definition_shape_checks() {
        let mut def = GraphDefinition::standard();
        def.entry.remove(&FlowKind::Content);
        def.success = "finished".into();
        def.routes.push(RouteDefinition { step: DONE.into(), flow: None, on: DecisionMatch::Any, next: "x".into() });
        let err = WorkflowGraph::from_definition(def).unwrap_err().to_string();
        assert!(err.contains("no entry step for CONTENT"));
        assert!(err.contains("success step `finished`"));
        assert!(err.contains("leaves terminal `done`"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut def = GraphDefinition::standard();
        def.routes.insert(
            0,
            RouteDefinition { step: "verify_sql".into(), flow: Some(FlowKind::Rule), on: DecisionMatch::Yes, next: "generate_sql".into() },
        );
        assert!(WorkflowGraph::from_definition(def).unwrap().has_cycle());
    }

    #[test]
    fn test_yaml_round_trip_of_standard_graph() {
        let yaml = serde_yaml_bw::to_string(&GraphDefinition::standard()).unwrap();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, yaml.as_bytes()).unwrap();
        let loaded = WorkflowGraph::load(file.path()).unwrap();
        assert_eq!(loaded.definition(), &GraphDefinition::standard());
    }

    #[test]
    fn test_shipped_workflow_matches_standard() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/workflow.yaml");
        let shipped = WorkflowGraph::load(&path).unwrap();
        assert_eq!(shipped.definition(), &GraphDefinition::standard());
        assert!(shipped.validate(&STEPS).is_ok());
    }
}
