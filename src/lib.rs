//! tabvox: multi-tab voice assistant orchestrator
//!
//! This library provides:
//! - Per-tab memory sessions that carry conversation context into a stateless CLI agent
//! - An agent invoker with retries and a canned failure reply
//! - An orchestrator with session admission, eviction and live metrics
//! - An HTTP gateway with a WebSocket push channel and a TTS proxy
//! - A durable JSON snapshot of conversations

pub mod agent;
pub mod config;
pub mod core;
pub mod orchestration;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use orchestration::Orchestrator;

use agent::{AgentInvoker, CliAgent, RetryPolicy};
use std::sync::Arc;

/// Build the process-wide orchestrator for `config`, backed by the CLI agent
pub fn orchestrator_from_config(config: &Config) -> Orchestrator {
    Orchestrator::new(config.sessions.clone(), invoker_from_config(config))
}

/// Invoker running the configured CLI agent under the configured retry policy
pub fn invoker_from_config(config: &Config) -> Arc<AgentInvoker> {
    let backend = CliAgent::from_config(&config.agent);
    Arc::new(AgentInvoker::new(
        Arc::new(backend),
        RetryPolicy::from_config(&config.agent),
    ))
}
