//! Push-channel event types
//!
//! Serialized as JSON objects tagged by `type`, e.g.
//! `{"type":"response","tab_id":"tab_1","text":"..."}`.

use crate::core::TabId;
use serde::{Deserialize, Serialize};

/// Server → client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One per completed user turn
    Response { tab_id: TabId, text: String },
    /// Periodic live metrics; best-effort
    RealtimeStats {
        tab_id: TabId,
        /// Seconds
        duration: f64,
        tokens: u64,
        is_processing: bool,
    },
    SessionCreated { tab_id: TabId },
    SessionClosed { tab_id: TabId },
    TabSwitched { tab_id: TabId },
}

impl ServerEvent {
    pub fn tab_id(&self) -> &TabId {
        match self {
            Self::Response { tab_id, .. }
            | Self::RealtimeStats { tab_id, .. }
            | Self::SessionCreated { tab_id }
            | Self::SessionClosed { tab_id }
            | Self::TabSwitched { tab_id } => tab_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::RealtimeStats { .. } => "realtime_stats",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionClosed { .. } => "session_closed",
            Self::TabSwitched { .. } => "tab_switched",
        }
    }
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    SwitchTab { tab_id: TabId },
}
