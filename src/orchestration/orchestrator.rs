//! Orchestrator - tab → session bindings, admission, metrics and lifecycle events
//!
//! The registry lives under one mutex, so admission and eviction are
//! linearizable. Each session's memory sits behind its own async mutex; a turn
//! holds it for the whole agent call, which keeps one turn in flight per tab.

use super::events::ServerEvent;
use super::fabric;
use crate::agent::AgentInvoker;
use crate::config::SessionsConfig;
use crate::core::{MemorySession, SessionError, SessionId, TabId};
use crate::storage::{CumulativeStats, Snapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// Orchestrator's view of one memory session
#[derive(Debug, Clone)]
pub struct BotSession {
    pub session_id: SessionId,
    pub tab_id: TabId,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Creation ordinal, final tie-breaker for eviction
    seq: u64,
    pub current_request_tokens: u64,
    /// Seconds
    pub current_request_duration: f64,
    pub current_request_start: Option<Instant>,
    pub total_tokens: u64,
    /// Seconds
    pub total_duration: f64,
    pub message_count: u64,
}

impl BotSession {
    fn new(session_id: SessionId, tab_id: TabId, project_name: String, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            tab_id,
            project_name,
            created_at: now,
            last_activity: now,
            seq,
            current_request_tokens: 0,
            current_request_duration: 0.0,
            current_request_start: None,
            total_tokens: 0,
            total_duration: 0.0,
            message_count: 0,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.current_request_start.is_some()
    }

    fn begin_request(&mut self, started: Instant) {
        self.current_request_tokens = 0;
        self.current_request_duration = 0.0;
        self.current_request_start = Some(started);
    }

    fn finish_request(&mut self, tokens: u64, duration: f64) {
        self.current_request_tokens = tokens;
        self.current_request_duration = duration;
        self.current_request_start = None;
        self.total_tokens += tokens;
        self.total_duration += duration;
        self.message_count += 1;
        self.last_activity = Utc::now();
    }

    fn eviction_key(&self) -> (DateTime<Utc>, DateTime<Utc>, u64) {
        (self.last_activity, self.created_at, self.seq)
    }

    /// UI snapshot; duration is live while a request is running
    pub fn info(&self) -> SessionInfo {
        let current_request_duration = match self.current_request_start {
            Some(started) => started.elapsed().as_secs_f64(),
            None => self.current_request_duration,
        };
        SessionInfo {
            session_id: self.session_id.clone(),
            tab_id: self.tab_id.clone(),
            project_name: self.project_name.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            is_processing: self.is_processing(),
            current_request_tokens: self.current_request_tokens,
            current_request_duration,
            total_tokens: self.total_tokens,
            total_duration: self.total_duration,
            message_count: self.message_count,
        }
    }

    fn cumulative(&self) -> CumulativeStats {
        CumulativeStats {
            message_count: self.message_count,
            total_tokens: self.total_tokens,
            total_duration: self.total_duration,
        }
    }
}

/// UI snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub tab_id: TabId,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_processing: bool,
    pub current_request_tokens: u64,
    /// Live while processing, otherwise the last request's duration (seconds)
    pub current_request_duration: f64,
    pub total_tokens: u64,
    pub total_duration: f64,
    pub message_count: u64,
}

/// State shared between the registry entry and the session's workers
pub(super) struct SessionCore {
    pub(super) session_id: SessionId,
    pub(super) bot: Mutex<BotSession>,
    pub(super) memory: AsyncMutex<MemorySession>,
}

/// Registry entry; dropping it closes the inbox and winds the workers down
#[derive(Clone)]
struct SessionHandle {
    core: Arc<SessionCore>,
    inbox: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<TabId, SessionHandle>,
    active_tab: Option<TabId>,
    next_seq: u64,
}

impl Registry {
    /// Oldest sessions by (last_activity, created_at): at least one, up to a quarter
    fn eviction_victims(&self) -> Vec<TabId> {
        let mut ranked: Vec<_> = self
            .sessions
            .iter()
            .map(|(tab, handle)| (lock(&handle.core.bot).eviction_key(), tab.clone()))
            .collect();
        ranked.sort();
        let count = (ranked.len() / 4).max(1).min(ranked.len());
        ranked.into_iter().take(count).map(|(_, tab)| tab).collect()
    }

    fn remove(&mut self, tab: &TabId) -> Option<SessionHandle> {
        if self.active_tab.as_ref() == Some(tab) {
            self.active_tab = None;
        }
        self.sessions.remove(tab)
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: SessionsConfig,
    invoker: Arc<AgentInvoker>,
    registry: Mutex<Registry>,
    latest: DashMap<TabId, String>,
    events: broadcast::Sender<ServerEvent>,
}

/// Single source of truth for tab → session bindings
///
/// Cheap to clone; every clone shares the same registry. Must be used from
/// within a tokio runtime because creating a session spawns its workers.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Non-owning handle held by background workers
#[derive(Clone)]
pub(super) struct WeakOrchestrator(Weak<Inner>);

impl WeakOrchestrator {
    pub(super) fn upgrade(&self) -> Option<Orchestrator> {
        self.0.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl Orchestrator {
    pub fn new(config: SessionsConfig, invoker: Arc<AgentInvoker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                invoker,
                registry: Mutex::new(Registry::default()),
                latest: DashMap::new(),
                events,
            }),
        }
    }

    fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.inner.config
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub(super) fn publish(&self, event: ServerEvent) {
        // No subscribers is fine: events are fire-and-forget
        let _ = self.inner.events.send(event);
    }

    /// Publish only while `tab_id` is still bound to `session_id`
    ///
    /// Sent under the registry lock, so nothing published here can trail the
    /// tab's `session_closed`. Returns whether the event went out.
    pub(super) fn publish_if_bound(
        &self,
        tab_id: &TabId,
        session_id: &SessionId,
        event: ServerEvent,
    ) -> bool {
        let registry = lock(&self.inner.registry);
        let bound = registry
            .sessions
            .get(tab_id)
            .is_some_and(|handle| &handle.core.session_id == session_id);
        if bound {
            let _ = self.inner.events.send(event);
        }
        bound
    }

    pub(super) fn stats_interval(&self) -> Duration {
        self.inner.config.stats_interval()
    }

    /// Create (or reuse) the session bound to `tab_id`
    ///
    /// An existing binding is kept and only its project name is updated, so
    /// the create and message paths yield the same registry state.
    pub fn create_session(
        &self,
        tab_id: &TabId,
        project_name: &str,
    ) -> Result<SessionInfo, SessionError> {
        let (handle, receivers, evicted) = {
            let mut registry = lock(&self.inner.registry);

            if let Some(existing) = registry.sessions.get(tab_id) {
                let mut bot = lock(&existing.core.bot);
                if !project_name.is_empty() {
                    bot.project_name = project_name.to_string();
                }
                return Ok(bot.info());
            }

            let max = self.inner.config.max_sessions;
            let mut evicted = Vec::new();
            if registry.sessions.len() >= max && !registry.sessions.is_empty() {
                for tab in registry.eviction_victims() {
                    if let Some(handle) = registry.remove(&tab) {
                        evicted.push((tab, handle));
                    }
                }
            }
            if registry.sessions.len() >= max {
                // Only reachable with max_sessions == 0, where nothing was evicted
                tracing::warn!(tab_id = %tab_id, max_sessions = max, "Session admission refused");
                return Err(SessionError::CapacityReached);
            }

            let seq = registry.next_seq;
            registry.next_seq += 1;
            let session_id = SessionId::generate();
            let (memory, replies) = MemorySession::new(
                session_id.clone(),
                tab_id.clone(),
                self.inner.config.max_context_turns,
                self.inner.invoker.clone(),
            );
            let (inbox, inbox_rx) = mpsc::unbounded_channel();
            let handle = SessionHandle {
                core: Arc::new(SessionCore {
                    session_id: session_id.clone(),
                    bot: Mutex::new(BotSession::new(
                        session_id,
                        tab_id.clone(),
                        project_name.to_string(),
                        seq,
                    )),
                    memory: AsyncMutex::new(memory),
                }),
                inbox,
            };
            registry.sessions.insert(tab_id.clone(), handle.clone());
            (handle, (replies, inbox_rx), evicted)
        };

        for (tab, handle) in evicted {
            tracing::info!(
                tab_id = %tab,
                session_id = %handle.core.session_id,
                "Evicted least recently active session"
            );
            self.inner.latest.remove(&tab);
            self.publish(ServerEvent::SessionClosed { tab_id: tab });
        }

        let (replies, inbox_rx) = receivers;
        fabric::spawn_workers(
            self.downgrade(),
            tab_id.clone(),
            handle.core.clone(),
            replies,
            inbox_rx,
        );

        let info = lock(&handle.core.bot).info();
        tracing::info!(
            tab_id = %tab_id,
            session_id = %info.session_id,
            project = %info.project_name,
            "Session created"
        );
        self.publish(ServerEvent::SessionCreated {
            tab_id: tab_id.clone(),
        });
        Ok(info)
    }

    fn handle(&self, tab_id: &TabId) -> Option<SessionHandle> {
        lock(&self.inner.registry).sessions.get(tab_id).cloned()
    }

    /// Resolve the session for `tab_id`, creating it lazily
    fn ensure_handle(&self, tab_id: &TabId) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.handle(tab_id) {
            return Ok(handle);
        }
        self.create_session(tab_id, &format!("Tab {tab_id}"))?;
        // A concurrent admission may have evicted it again already
        self.handle(tab_id)
            .ok_or_else(|| SessionError::NotFound(tab_id.to_string()))
    }

    pub fn ensure_session(&self, tab_id: &TabId) -> Result<SessionId, SessionError> {
        Ok(self.ensure_handle(tab_id)?.core.session_id.clone())
    }

    /// Whether `tab_id` is still bound to `session_id`
    pub(super) fn is_bound(&self, tab_id: &TabId, session_id: &SessionId) -> bool {
        lock(&self.inner.registry)
            .sessions
            .get(tab_id)
            .is_some_and(|handle| &handle.core.session_id == session_id)
    }

    /// Run one user turn to completion
    pub async fn route_message(
        &self,
        tab_id: &TabId,
        message: &str,
    ) -> Result<SessionId, SessionError> {
        let handle = self.ensure_handle(tab_id)?;
        self.run_turn(tab_id, &handle.core, message).await;
        Ok(handle.core.session_id.clone())
    }

    /// Queue a user turn on the tab's inbox and return immediately
    ///
    /// Queued turns run one at a time in submission order.
    pub fn submit(&self, tab_id: &TabId, message: &str) -> Result<SessionId, SessionError> {
        let handle = self.ensure_handle(tab_id)?;
        handle
            .inbox
            .send(message.to_string())
            .map_err(|_| SessionError::NotFound(tab_id.to_string()))?;
        Ok(handle.core.session_id.clone())
    }

    pub(super) async fn run_turn(&self, tab_id: &TabId, core: &SessionCore, message: &str) {
        let mut memory = core.memory.lock().await;

        let started = Instant::now();
        lock(&core.bot).begin_request(started);

        let outcome = memory.send(message).await;

        let duration = started.elapsed().as_secs_f64();
        let tokens = outcome.estimated_tokens();
        {
            // Under the registry lock so a concurrent close cannot leave a stale slot
            let registry = lock(&self.inner.registry);
            let bound = registry
                .sessions
                .get(tab_id)
                .is_some_and(|handle| handle.core.session_id == core.session_id);
            if bound {
                self.inner
                    .latest
                    .insert(tab_id.clone(), outcome.text.clone());
            }
        }
        lock(&core.bot).finish_request(tokens, duration);
        drop(memory);

        tracing::info!(
            tab_id = %tab_id,
            session_id = %core.session_id,
            attempts = outcome.invocation.attempts(),
            success = outcome.succeeded(),
            tokens,
            duration_secs = duration,
            "Turn completed"
        );
    }

    /// Make `tab_id` the foreground tab, creating its session if needed
    pub fn switch_tab(&self, tab_id: &TabId) -> Result<SessionId, SessionError> {
        let session_id = self.ensure_session(tab_id)?;
        lock(&self.inner.registry).active_tab = Some(tab_id.clone());
        tracing::debug!(tab_id = %tab_id, "Switched tab");
        self.publish(ServerEvent::TabSwitched {
            tab_id: tab_id.clone(),
        });
        Ok(session_id)
    }

    pub fn active_tab(&self) -> Option<TabId> {
        lock(&self.inner.registry).active_tab.clone()
    }

    /// Drop the binding and its memory; returns whether a session existed
    pub fn cleanup_session(&self, tab_id: &TabId) -> bool {
        let removed = lock(&self.inner.registry).remove(tab_id);
        self.inner.latest.remove(tab_id);
        match removed {
            Some(handle) => {
                tracing::info!(
                    tab_id = %tab_id,
                    session_id = %handle.core.session_id,
                    "Session closed"
                );
                self.publish(ServerEvent::SessionClosed {
                    tab_id: tab_id.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Close every session
    pub fn shutdown(&self) {
        let tabs: Vec<TabId> = lock(&self.inner.registry)
            .sessions
            .keys()
            .cloned()
            .collect();
        for tab in tabs {
            self.cleanup_session(&tab);
        }
    }

    pub fn get_session_info(&self, tab_id: &TabId) -> Option<SessionInfo> {
        let handle = self.handle(tab_id)?;
        let bot = lock(&handle.core.bot);
        Some(bot.info())
    }

    /// Snapshots for all sessions, oldest first
    pub fn list_active_sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = lock(&self.inner.registry)
            .sessions
            .values()
            .cloned()
            .collect();
        let mut infos: Vec<SessionInfo> = handles
            .iter()
            .map(|handle| lock(&handle.core.bot).info())
            .collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tab_id.cmp(&b.tab_id))
        });
        infos
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.registry).sessions.len()
    }

    /// Text of the most recent completed turn for `tab_id`
    pub fn latest_response(&self, tab_id: &TabId) -> Option<String> {
        self.inner.latest.get(tab_id).map(|entry| entry.value().clone())
    }

    /// Build a persistable snapshot from the live sessions
    ///
    /// Waits for in-flight turns so history and counters agree.
    pub async fn snapshot(&self) -> Snapshot {
        let handles: Vec<(TabId, SessionHandle)> = lock(&self.inner.registry)
            .sessions
            .iter()
            .map(|(tab, handle)| (tab.clone(), handle.clone()))
            .collect();

        let mut snapshot = Snapshot::default();
        for (tab, handle) in handles {
            let history = handle.core.memory.lock().await.history().to_vec();
            let bot = lock(&handle.core.bot).clone();
            snapshot.conversations.insert(tab.clone(), history);
            snapshot.tab_names.insert(tab.clone(), bot.project_name.clone());
            snapshot.cumulative.insert(tab, bot.cumulative());
        }
        snapshot
    }

    /// Recreate sessions from a snapshot; returns how many were restored
    ///
    /// Tabs beyond the session cap are skipped rather than evicting each other.
    pub async fn restore(&self, snapshot: &Snapshot) -> usize {
        let mut restored = 0;
        for tab in snapshot.tabs() {
            if self.handle(&tab).is_none() && self.session_count() >= self.inner.config.max_sessions
            {
                tracing::warn!(tab_id = %tab, "Skipping restore, session cap reached");
                continue;
            }
            let name = snapshot
                .tab_names
                .get(&tab)
                .cloned()
                .unwrap_or_else(|| format!("Tab {tab}"));
            if let Err(e) = self.create_session(&tab, &name) {
                tracing::warn!(tab_id = %tab, error = %e, "Failed to restore session");
                continue;
            }
            let Some(handle) = self.handle(&tab) else {
                continue;
            };
            if let Some(turns) = snapshot.conversations.get(&tab) {
                handle.core.memory.lock().await.seed(turns.clone());
            }
            if let Some(stats) = snapshot.cumulative.get(&tab) {
                let mut bot = lock(&handle.core.bot);
                bot.message_count = stats.message_count;
                bot.total_tokens = stats.total_tokens;
                bot.total_duration = stats.total_duration;
            }
            restored += 1;
        }
        tracing::info!(restored, "Sessions restored from snapshot");
        restored
    }
}
