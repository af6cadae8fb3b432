//! External agent invocation
//!
//! An [`AgentBackend`] runs one attempt; the [`AgentInvoker`] layers the
//! success predicate and retry policy on top and never fails outright.

mod cli;
mod invoker;

pub use cli::CliAgent;
pub use invoker::{AgentInvoker, Invocation, RetryPolicy, FAILURE_REPLY, WARNING_PREFIX};

use crate::core::errors::AgentError;
use async_trait::async_trait;

/// One attempt at turning a rendered prompt into raw agent output
///
/// Implementations report process-level failures as errors and return stdout
/// untouched otherwise; output validation belongs to the invoker.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Run a single attempt
    async fn run(&self, prompt: &str) -> Result<String, AgentError>;
}
