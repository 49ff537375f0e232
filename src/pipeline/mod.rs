//! Message classification pipeline.
//!
//! Every inbox message flows through:
//! 1. `RulesEngine`: sniper rules on the sender, then the kill list (no LLM)
//! 2. `LlmClassifier`: AI mode, only when nothing above matched
//! 3. `ActionExecutor`: batched label / trash calls against Gmail
//!
//! `InboxPoller` drives one cycle of this per poll interval.

pub mod classifier;
pub mod executor;
pub mod poller;
pub mod router;
pub mod rules;
pub mod types;
