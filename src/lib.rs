//! Calm Mail: Gmail inbox triage with sender rules and a local LLM.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod gmail;
pub mod llm;
pub mod pipeline;
pub mod store;
