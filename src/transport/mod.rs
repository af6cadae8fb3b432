//! Transport layer: HTTP gateway, WebSocket push channel and TTS proxy

pub mod http;
pub mod tts;
pub mod ws;

pub use http::{build_router, run_http_server, spawn_autosave, AppState};
pub use tts::TtsProxy;
