//! Shared harness: a scripted agent, orchestrator builders and an in-process gateway

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabvox::agent::{AgentBackend, AgentInvoker, RetryPolicy};
use tabvox::config::{SessionsConfig, TtsConfig};
use tabvox::core::{AgentError, TabId};
use tabvox::orchestration::{Orchestrator, ServerEvent};
use tabvox::storage::SnapshotStore;
use tabvox::transport::{build_router, spawn_autosave, AppState, TtsProxy};
use tokio::sync::broadcast;

/// Agent stand-in: replays scripted stdout, then answers `reply <n>`
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<VecDeque<String>>,
    repeat: Option<String>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(lines: &[&str]) -> Self {
        Self {
            script: Mutex::new(lines.iter().map(|l| l.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn always(stdout: &str) -> Self {
        Self {
            repeat: Some(stdout.to_string()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, prompt: &str) -> Result<String, AgentError> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        Ok(self
            .repeat
            .clone()
            .unwrap_or_else(|| format!("reply {call}")))
    }
}

pub fn tab(id: &str) -> TabId {
    TabId::parse(id).unwrap()
}

pub fn invoker(agent: Arc<ScriptedAgent>) -> Arc<AgentInvoker> {
    Arc::new(AgentInvoker::new(
        agent,
        RetryPolicy::new(3, Duration::ZERO, "execution error"),
    ))
}

pub fn orchestrator(agent: Arc<ScriptedAgent>, max_sessions: usize) -> Orchestrator {
    Orchestrator::new(
        SessionsConfig {
            max_sessions,
            max_context_turns: 10,
            stats_interval_ms: 20,
        },
        invoker(agent),
    )
}

/// Next `response` event for `tab_id`, skipping everything else
pub async fn next_response(events: &mut broadcast::Receiver<ServerEvent>, tab_id: &TabId) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Response { tab_id: t, text }) if &t == tab_id => return text,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a response event")
}

/// Poll until `check` holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub struct TestServer {
    pub base: String,
    pub addr: std::net::SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Gateway on an ephemeral port, sharing `orchestrator`
pub async fn spawn_server(
    orchestrator: Orchestrator,
    store_path: &std::path::Path,
    tts_url: &str,
) -> TestServer {
    let tts = TtsProxy::from_config(&TtsConfig {
        url: tts_url.to_string(),
        default_voice: "default".to_string(),
        timeout_secs: 5,
    })
    .unwrap();
    let state = Arc::new(AppState::new(
        orchestrator,
        SnapshotStore::new(store_path),
        false,
        tts,
    ));
    spawn_autosave(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        addr,
        state,
    }
}
