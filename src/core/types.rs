//! Canonical type definitions for the core domain
//!
//! Tab ids, session ids and conversation turns are shared by the orchestrator,
//! the storage layer and the gateway; all of them use these definitions.

use super::errors::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Client-chosen tab identifier, canonicalized at construction
///
/// Canonical form: surrounding whitespace trimmed and hyphens folded into
/// underscores, so `tab-1` and `tab_1` name the same tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TabId(String);

impl TabId {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let canonical = canonicalize_tab_id(raw);
        if canonical.is_empty() || canonical.chars().any(char::is_control) {
            return Err(SessionError::InvalidTabId(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TabId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TabId> for String {
    fn from(value: TabId) -> Self {
        value.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize_tab_id(raw: &str) -> String {
    raw.trim().replace('-', "_")
}

/// Server-generated session identifier, stable for the life of a memory session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used when rendering a context prompt
    pub fn prompt_label(&self) -> &'static str {
        match self {
            Self::User => "Human:",
            Self::Assistant => "Assistant:",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// When a turn was recorded, in whichever form the writer used
///
/// Browsers send `Date.now()` milliseconds; the server writes RFC 3339.
/// Both are kept as given so a saved conversation reads back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Rfc3339(DateTime<Utc>),
}

impl Timestamp {
    pub fn now() -> Self {
        Self::Rfc3339(Utc::now())
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Self::Rfc3339(dt) => Some(*dt),
        }
    }
}

/// Key the turn's text travelled under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum TextKey {
    #[default]
    Text,
    Content,
}

#[derive(Serialize, Deserialize)]
struct WireTurn {
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Timestamp>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// One message in a conversation; never mutated after it is appended
///
/// Turns written by the UI keep their shape: the text key, the timestamp form
/// and any fields the server does not read come back exactly as they went in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireTurn", into = "WireTurn")]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: Option<Timestamp>,
    key: TextKey,
    extra: Map<String, Value>,
}

impl Turn {
    fn new(role: Role, text: String) -> Self {
        Self {
            role,
            text,
            timestamp: Some(Timestamp::now()),
            key: TextKey::Text,
            extra: Map::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text.into())
    }
}

impl TryFrom<WireTurn> for Turn {
    type Error = String;

    fn try_from(wire: WireTurn) -> Result<Self, Self::Error> {
        let (text, key) = match (wire.text, wire.content) {
            (Some(text), _) => (text, TextKey::Text),
            (None, Some(content)) => (content, TextKey::Content),
            (None, None) => return Err("turn has neither `text` nor `content`".to_string()),
        };
        Ok(Self {
            role: wire.role,
            text,
            timestamp: wire.timestamp,
            key,
            extra: wire.extra,
        })
    }
}

impl From<Turn> for WireTurn {
    fn from(turn: Turn) -> Self {
        let (text, content) = match turn.key {
            TextKey::Text => (Some(turn.text), None),
            TextKey::Content => (None, Some(turn.text)),
        };
        Self {
            role: turn.role,
            text,
            content,
            timestamp: turn.timestamp,
            extra: turn.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_id_canonical_form() {
        let a = TabId::parse("tab-1").unwrap();
        let b = TabId::parse(" tab_1 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "tab_1");
    }

    #[test]
    fn test_tab_id_rejects_blank() {
        assert!(matches!(
            TabId::parse("   "),
            Err(SessionError::InvalidTabId(_))
        ));
        assert!(TabId::parse("tab\n1").is_err());
    }

    #[test]
    fn test_tab_id_deserializes_canonically() {
        let tab: TabId = serde_json::from_str("\"tab-7\"").unwrap();
        assert_eq!(tab.as_str(), "tab_7");
        assert!(serde_json::from_str::<TabId>("\"\"").is_err());
    }

    #[test]
    fn test_turn_accepts_content_alias() {
        let turn: Turn =
            serde_json::from_str(r#"{"role":"assistant","content":"hello"}"#).unwrap();
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.text, "hello");
        assert!(turn.timestamp.is_none());
    }

    #[test]
    fn test_turn_keeps_ui_shape() {
        let raw = serde_json::json!({
            "role": "user",
            "content": "hi",
            "timestamp": 1700000000000i64,
            "id": "m-1"
        });
        let turn: Turn = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(turn.text, "hi");
        assert_eq!(
            turn.timestamp.and_then(|t| t.to_datetime()).map(|d| d.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(serde_json::to_value(&turn).unwrap(), raw);
    }

    #[test]
    fn test_turn_accepts_rfc3339_timestamp() {
        let turn: Turn = serde_json::from_str(
            r#"{"role":"assistant","text":"ok","timestamp":"2024-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(matches!(turn.timestamp, Some(Timestamp::Rfc3339(_))));
        let back = serde_json::to_value(&turn).unwrap();
        assert_eq!(back["text"], "ok");
        assert!(back.get("content").is_none());
    }

    #[test]
    fn test_turn_requires_text() {
        assert!(serde_json::from_str::<Turn>(r#"{"role":"user"}"#).is_err());
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
