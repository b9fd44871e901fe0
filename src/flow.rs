// src/flow.rs

pub mod graph;
pub mod supervisor;

pub use graph::{DONE, DecisionMatch, GraphDefinition, HUMAN_REVIEW, RouteDefinition, WorkflowGraph};
pub use supervisor::{FinalResult, Request, StepRecord, Supervisor, SupervisorOptions};
