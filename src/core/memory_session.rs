//! Memory Session - one conversation's rolling memory
//!
//! Handles:
//! - Turn history, trimmed from the front to a bounded length
//! - Context prompt construction from the trailing window
//! - Calling the agent invoker
//! - Publishing each reply exactly once to the session's reply channel

use super::tokenizer::estimate_tokens;
use super::types::{SessionId, TabId, Turn};
use crate::agent::{AgentInvoker, Invocation};
use std::sync::Arc;
use tokio::sync::mpsc;

/// First line of every context prompt
const CONTEXT_INSTRUCTION: &str =
    "Continue this conversation. Here is the recent context (oldest first):";

/// What one call to [`MemorySession::send`] produced
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Text shown to the user (reply, retry-adorned reply, or apology)
    pub text: String,
    /// The prompt handed to the agent
    pub prompt: String,
    pub invocation: Invocation,
}

impl TurnOutcome {
    pub fn succeeded(&self) -> bool {
        self.invocation.reply().is_some()
    }

    /// Coarse token estimate; a failed turn costs nothing
    pub fn estimated_tokens(&self) -> u64 {
        match self.invocation.reply() {
            Some(reply) => estimate_tokens(&self.prompt, reply),
            None => 0,
        }
    }
}

pub struct MemorySession {
    session_id: SessionId,
    tab_id: TabId,
    turns: Vec<Turn>,
    max_context_turns: usize,
    invoker: Arc<AgentInvoker>,
    replies: mpsc::UnboundedSender<String>,
}

impl MemorySession {
    /// Create a session and the receiving end of its reply channel
    pub fn new(
        session_id: SessionId,
        tab_id: TabId,
        max_context_turns: usize,
        invoker: Arc<AgentInvoker>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let session = Self {
            session_id,
            tab_id,
            turns: Vec::new(),
            max_context_turns,
            invoker,
            replies,
        };
        (session, rx)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Retained turns, oldest first
    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Upper bound on retained turns
    fn retained_cap(&self) -> usize {
        (self.max_context_turns * 2).max(2)
    }

    /// Replace history with previously saved turns (restore path)
    pub fn seed(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
        self.trim();
    }

    /// Render the prompt for `message` given the current history
    pub fn build_prompt(&self, message: &str) -> String {
        let start = self.turns.len().saturating_sub(self.max_context_turns);
        let window = &self.turns[start..];
        if window.is_empty() {
            return message.to_string();
        }

        let mut prompt = String::from(CONTEXT_INSTRUCTION);
        prompt.push_str("\n\n");
        for turn in window {
            prompt.push_str(turn.role.prompt_label());
            prompt.push(' ');
            prompt.push_str(&turn.text);
            prompt.push('\n');
        }
        prompt.push_str("\nHuman: ");
        prompt.push_str(message);
        prompt.push_str("\n\nAssistant:");
        prompt
    }

    /// Run one user turn through the agent
    ///
    /// The user turn is always recorded; an assistant turn only when the agent
    /// produced a reply, so the next prompt never anchors on an apology.
    pub async fn send(&mut self, message: &str) -> TurnOutcome {
        let prompt = self.build_prompt(message);
        self.turns.push(Turn::user(message));

        tracing::debug!(
            tab_id = %self.tab_id,
            session_id = %self.session_id,
            prompt_chars = prompt.len(),
            "Sending turn to agent"
        );

        let invocation = self.invoker.invoke(&prompt).await;
        if let Some(reply) = invocation.reply() {
            self.turns.push(Turn::assistant(reply));
        }
        self.trim();

        let text = invocation.user_text();
        if self.replies.send(text.clone()).is_err() {
            tracing::debug!(tab_id = %self.tab_id, "Reply channel closed, reply not delivered");
        }

        TurnOutcome {
            text,
            prompt,
            invocation,
        }
    }

    fn trim(&mut self) {
        let cap = self.retained_cap();
        if self.turns.len() > cap {
            let excess = self.turns.len() - cap;
            self.turns.drain(..excess);
        }
    }
}
