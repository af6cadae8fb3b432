//! Session orchestration
//!
//! The [`Orchestrator`] owns tab → session bindings and publishes
//! [`ServerEvent`]s; the fabric workers carry replies and live stats from
//! each session onto that bus.

pub mod events;
mod fabric;
pub mod orchestrator;

pub use events::{ClientEvent, ServerEvent};
pub use orchestrator::{BotSession, Orchestrator, SessionInfo};
