pub mod agent;
pub mod app;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod flow;
pub mod llm;
pub mod logger;
pub mod payload;
pub mod retry;
pub mod step;
pub mod store;
pub mod tool;
