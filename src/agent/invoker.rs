//! Success predicate and retry policy around an [`AgentBackend`]

use super::AgentBackend;
use crate::config::AgentConfig;
use crate::core::errors::AgentError;
use std::sync::Arc;
use std::time::Duration;

/// Leading token of any user-visible retry notice
pub const WARNING_PREFIX: &str = "⚠️";

/// Reply shown when every attempt failed
pub const FAILURE_REPLY: &str =
    "Sorry, I couldn't process that request after multiple attempts. Please try again.";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause before each retry
    pub delay: Duration,
    /// Lower-cased marker the agent prints on a logical failure
    error_marker: String,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, error_marker: &str) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            error_marker: error_marker.to_lowercase(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay(), &config.error_marker)
    }

    /// Success predicate applied to the stdout of a clean exit
    fn accept(&self, stdout: String) -> Result<String, AgentError> {
        let reply = stdout.trim();
        if reply.is_empty() {
            return Err(AgentError::EmptyOutput);
        }
        if !self.error_marker.is_empty() && reply.to_lowercase().contains(&self.error_marker) {
            return Err(AgentError::ExecutionError(reply.chars().take(200).collect()));
        }
        Ok(reply.to_string())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// Result of a full invocation, after retries
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Success { reply: String, attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

impl Invocation {
    /// Plain assistant reply, if any attempt succeeded
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Success { reply, .. } => Some(reply),
            Self::Failed { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Text shown to the user: the reply, the reply behind a retry notice, or the apology
    pub fn user_text(&self) -> String {
        match self {
            Self::Success { reply, attempts: 1 } => reply.clone(),
            Self::Success { reply, attempts } => {
                format!("{WARNING_PREFIX} Retry attempt {attempts} succeeded:\n\n{reply}")
            }
            Self::Failed { .. } => FAILURE_REPLY.to_string(),
        }
    }
}

/// Runs a backend under the retry policy. Knows nothing about tabs or sessions.
pub struct AgentInvoker {
    backend: Arc<dyn AgentBackend>,
    policy: RetryPolicy,
}

impl AgentInvoker {
    pub fn new(backend: Arc<dyn AgentBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke with retries; failure is reported in the value, never as an error
    pub async fn invoke(&self, prompt: &str) -> Invocation {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tracing::warn!(
                    agent = %self.backend.name(),
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "{} Retrying agent after: {}",
                    WARNING_PREFIX,
                    last_error
                );
                tokio::time::sleep(self.policy.delay).await;
            }

            match self
                .backend
                .run(prompt)
                .await
                .and_then(|stdout| self.policy.accept(stdout))
            {
                Ok(reply) => {
                    tracing::debug!(agent = %self.backend.name(), attempt, "Agent attempt succeeded");
                    return Invocation::Success {
                        reply,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    tracing::debug!(agent = %self.backend.name(), attempt, error = %err, "Agent attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        tracing::error!(
            agent = %self.backend.name(),
            attempts = self.policy.max_attempts,
            error = %last_error,
            "Agent failed after all attempts"
        );
        Invocation::Failed {
            attempts: self.policy.max_attempts,
            last_error,
        }
    }

    /// `invoke` flattened to the text the user should see
    pub async fn invoke_text(&self, prompt: &str) -> String {
        self.invoke(prompt).await.user_text()
    }
}
