//! HTTP gateway for the browser UI
//!
//! Canonicalizes tab ids, forwards to the orchestrator, and turns every
//! failure into `{success: false, error}`. Nothing here raises past a handler.

use super::tts::TtsProxy;
use super::ws;
use crate::config::Config;
use crate::core::{SessionError, TabId};
use crate::orchestration::{Orchestrator, ServerEvent};
use crate::storage::{Snapshot, SnapshotStore};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::{Any, CorsLayer};

/// Shared application state
pub struct AppState {
    pub orchestrator: Orchestrator,
    store: SnapshotStore,
    save_mode: AtomicBool,
    tts: TtsProxy,
    /// Serializes writers of the blob so an autosave merge never interleaves with a user save
    persist: AsyncMutex<()>,
}

impl AppState {
    pub fn new(
        orchestrator: Orchestrator,
        store: SnapshotStore,
        save_mode: bool,
        tts: TtsProxy,
    ) -> Self {
        Self {
            orchestrator,
            store,
            save_mode: AtomicBool::new(save_mode),
            tts,
            persist: AsyncMutex::new(()),
        }
    }

    pub fn save_mode(&self) -> bool {
        self.save_mode.load(Ordering::Relaxed)
    }

    pub fn set_save_mode(&self, enabled: bool) {
        self.save_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .context("Snapshot writer panicked")?
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .context("Snapshot reader panicked")?
    }

    async fn clear(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear())
            .await
            .context("Snapshot remover panicked")?
    }

    /// Merge the live sessions into the stored blob
    pub async fn autosave(&self) -> Result<()> {
        let live = self.orchestrator.snapshot().await;
        let _guard = self.persist.lock().await;
        let mut stored = match self.load().await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Stored sessions unreadable, rewriting: {:#}", e);
                Snapshot::default()
            }
        };
        stored.merge_live(live);
        self.save(stored).await
    }

    /// Replace the blob with a user-supplied snapshot
    pub async fn save_user(&self, snapshot: Snapshot) -> Result<()> {
        let _guard = self.persist.lock().await;
        self.save(snapshot).await
    }

    pub async fn clear_saved(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        self.clear().await
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    tab_id: String,
    #[serde(default)]
    project_name: String,
}

#[derive(Debug, Deserialize)]
struct SendCommandRequest {
    tab_id: String,
    command: String,
}

#[derive(Debug, Deserialize)]
struct TabRequest {
    tab_id: String,
}

#[derive(Debug, Deserialize)]
struct TtsRequest {
    text: String,
    #[serde(default)]
    voice: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    save_mode: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    commit: String,
    sessions: usize,
}

fn failure(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

/// Unwrap a JSON body, answering malformed ones with the failure shape
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            tracing::debug!("Rejected request body: {}", rejection.body_text());
            Err(failure(StatusCode::BAD_REQUEST, rejection.body_text()))
        }
    }
}

fn session_failure(err: SessionError) -> Response {
    let status = match err {
        SessionError::InvalidTabId(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::CapacityReached => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, err)
}

/// Build the gateway router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/create_session", post(create_session))
        .route("/send_command", post(send_command))
        .route("/close_session", post(close_session))
        .route("/session_count", get(session_count))
        .route("/switch_tab", post(switch_tab))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:tab_id", get(get_session))
        .route("/save_sessions", post(save_sessions))
        .route("/load_sessions", get(load_sessions))
        .route("/clear_sessions", post(clear_sessions))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/tts", post(text_to_speech))
        .route("/ws", get(ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Persist after every delivered reply while save mode is on
pub fn spawn_autosave(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut events = state.orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Response { tab_id, .. }) if state.save_mode() => {
                    if let Err(e) = state.autosave().await {
                        tracing::warn!(tab_id = %tab_id, "Autosave failed: {:#}", e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Autosave lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Run the HTTP server until ctrl-c
pub async fn run_http_server(config: Config, orchestrator: Orchestrator) -> Result<()> {
    let store = SnapshotStore::new(config.storage.path.clone());
    let tts = TtsProxy::from_config(&config.tts)?;
    let state = Arc::new(AppState::new(
        orchestrator.clone(),
        store,
        config.storage.save_mode,
        tts,
    ));

    let autosave = spawn_autosave(state.clone());
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    orchestrator.shutdown();
    autosave.abort();
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: env!("TABVOX_GIT_HASH").to_string(),
        sessions: state.orchestrator.session_count(),
    })
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let tab_id = match TabId::parse(&req.tab_id) {
        Ok(tab_id) => tab_id,
        Err(e) => return session_failure(e),
    };
    let project_name = if req.project_name.trim().is_empty() {
        format!("Tab {tab_id}")
    } else {
        req.project_name
    };

    match state.orchestrator.create_session(&tab_id, &project_name) {
        Ok(info) => Json(json!({ "success": true, "session_id": info.session_id })).into_response(),
        Err(e) => session_failure(e),
    }
}

async fn send_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendCommandRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let tab_id = match TabId::parse(&req.tab_id) {
        Ok(tab_id) => tab_id,
        Err(e) => return session_failure(e),
    };
    if req.command.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Empty command");
    }

    match state.orchestrator.submit(&tab_id, &req.command) {
        Ok(session_id) => {
            Json(json!({ "success": true, "session_id": session_id })).into_response()
        }
        Err(e) => session_failure(e),
    }
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TabRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    match TabId::parse(&req.tab_id) {
        Ok(tab_id) => {
            let closed = state.orchestrator.cleanup_session(&tab_id);
            Json(json!({ "success": true, "closed": closed })).into_response()
        }
        Err(e) => session_failure(e),
    }
}

async fn session_count(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "count": state.orchestrator.session_count() }))
}

async fn switch_tab(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TabRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let result = TabId::parse(&req.tab_id).and_then(|tab_id| state.orchestrator.switch_tab(&tab_id));
    match result {
        Ok(session_id) => {
            Json(json!({ "success": true, "session_id": session_id })).into_response()
        }
        Err(e) => session_failure(e),
    }
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "active_tab": state.orchestrator.active_tab(),
        "sessions": state.orchestrator.list_active_sessions(),
    }))
    .into_response()
}

async fn get_session(State(state): State<Arc<AppState>>, Path(raw): Path<String>) -> Response {
    let tab_id = match TabId::parse(&raw) {
        Ok(tab_id) => tab_id,
        Err(e) => return session_failure(e),
    };
    match state.orchestrator.get_session_info(&tab_id) {
        Some(info) => Json(info).into_response(),
        None => session_failure(SessionError::NotFound(tab_id.to_string())),
    }
}

async fn save_sessions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Snapshot>, JsonRejection>,
) -> Response {
    let snapshot = match parse_body(payload) {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    let tabs = snapshot.tabs().len();
    match state.save_user(snapshot).await {
        Ok(()) => {
            tracing::info!(tabs, "Sessions saved");
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => {
            tracing::warn!("Failed to save sessions: {:#}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

async fn load_sessions(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match state.load().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("Failed to load sessions: {:#}", e);
            return failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
        }
    };

    let has_data = snapshot.as_ref().is_some_and(|s| !s.is_empty());
    let snapshot = snapshot.unwrap_or_default();
    let mut body = Map::new();
    for (key, value) in snapshot.extra {
        body.insert(key, value);
    }
    body.insert("success".into(), Value::Bool(true));
    body.insert("hasData".into(), Value::Bool(has_data));
    body.insert("conversations".into(), json!(snapshot.conversations));
    body.insert("tabNames".into(), json!(snapshot.tab_names));
    body.insert("cumulative".into(), json!(snapshot.cumulative));
    Json(Value::Object(body)).into_response()
}

async fn clear_sessions(State(state): State<Arc<AppState>>) -> Response {
    match state.clear_saved().await {
        Ok(()) => {
            tracing::info!("Saved sessions cleared");
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => {
            tracing::warn!("Failed to clear sessions: {:#}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "save_mode": state.save_mode() }))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SettingsRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    state.set_save_mode(req.save_mode);
    tracing::info!(save_mode = req.save_mode, "Settings updated");
    Json(json!({ "success": true, "save_mode": req.save_mode })).into_response()
}

async fn text_to_speech(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TtsRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    match state.tts.synthesize(&req.text, req.voice.as_deref()).await {
        Ok(audio) => ([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response(),
        Err(e) => {
            tracing::warn!("TTS failed: {:#}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}
