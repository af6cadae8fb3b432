//! Core domain modules
//!
//! Identifiers, turns, token estimation, domain errors and the per-tab memory
//! session. Nothing here knows about HTTP or the event bus.

pub mod errors;
pub mod memory_session;
pub mod tokenizer;
pub mod types;

pub use errors::{AgentError, SessionError};
pub use memory_session::{MemorySession, TurnOutcome};
pub use types::{Role, SessionId, TabId, Timestamp, Turn};
