//! AI Orchestrator: goal-driven task graph executed by a bounded pool of LLM workers.

pub mod admin;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod health;
pub mod llm;
pub mod orchestrator;
pub mod safety;
pub mod store;
pub mod tools;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
