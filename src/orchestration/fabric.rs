//! Response fabric - per-session background workers
//!
//! Every session gets three tasks:
//! - turn worker: drains the inbox, one turn at a time, in submission order
//! - response worker: forwards each reply from the reply channel as a
//!   `response` event, exactly once
//! - stats worker: emits `realtime_stats` on a fixed cadence until the tab is
//!   no longer bound to this session
//!
//! Workers hold the orchestrator weakly, so they never keep it alive. Once a
//! session is closed or evicted, turns still queued on its inbox are dropped
//! without reaching the agent, and a reply from a turn that was already
//! running is discarded instead of published.

use super::events::ServerEvent;
use super::orchestrator::{lock, SessionCore, WeakOrchestrator};
use crate::core::{SessionId, TabId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub(super) fn spawn_workers(
    orchestrator: WeakOrchestrator,
    tab_id: TabId,
    core: Arc<SessionCore>,
    replies: mpsc::UnboundedReceiver<String>,
    inbox: mpsc::UnboundedReceiver<String>,
) {
    let Some(strong) = orchestrator.upgrade() else {
        return;
    };
    let interval = strong.stats_interval();
    drop(strong);

    tokio::spawn(response_worker(
        orchestrator.clone(),
        tab_id.clone(),
        core.session_id.clone(),
        replies,
    ));
    tokio::spawn(stats_worker(
        orchestrator.clone(),
        tab_id.clone(),
        core.clone(),
        interval,
    ));
    tokio::spawn(turn_worker(orchestrator, tab_id, core, inbox));
}

async fn turn_worker(
    orchestrator: WeakOrchestrator,
    tab_id: TabId,
    core: Arc<SessionCore>,
    mut inbox: mpsc::UnboundedReceiver<String>,
) {
    while let Some(message) = inbox.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        if !orchestrator.is_bound(&tab_id, &core.session_id) {
            inbox.close();
            let mut dropped = 1;
            while inbox.try_recv().is_ok() {
                dropped += 1;
            }
            tracing::debug!(
                tab_id = %tab_id,
                session_id = %core.session_id,
                dropped,
                "Discarded turns queued on a closed session"
            );
            break;
        }
        orchestrator.run_turn(&tab_id, &core, &message).await;
    }
    tracing::debug!(tab_id = %tab_id, session_id = %core.session_id, "Turn worker stopped");
}

async fn response_worker(
    orchestrator: WeakOrchestrator,
    tab_id: TabId,
    session_id: SessionId,
    mut replies: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = replies.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        let chars = text.len();
        let event = ServerEvent::Response {
            tab_id: tab_id.clone(),
            text,
        };
        if orchestrator.publish_if_bound(&tab_id, &session_id, event) {
            tracing::debug!(tab_id = %tab_id, chars, "Published response");
        } else {
            tracing::debug!(tab_id = %tab_id, chars, "Dropped reply for a closed session");
        }
    }
    tracing::debug!(tab_id = %tab_id, "Response worker stopped");
}

async fn stats_worker(
    orchestrator: WeakOrchestrator,
    tab_id: TabId,
    core: Arc<SessionCore>,
    period: std::time::Duration,
) {
    let session_id = core.session_id.clone();
    // Only the metrics are needed here; holding the core would keep the memory alive
    let weak_core = Arc::downgrade(&core);
    drop(core);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        if !orchestrator.is_bound(&tab_id, &session_id) {
            break;
        }
        let Some(core) = weak_core.upgrade() else {
            break;
        };
        let event = {
            let bot = lock(&core.bot);
            let info = bot.info();
            ServerEvent::RealtimeStats {
                tab_id: tab_id.clone(),
                duration: info.current_request_duration,
                tokens: info.current_request_tokens,
                is_processing: info.is_processing,
            }
        };
        orchestrator.publish(event);
    }
    tracing::debug!(tab_id = %tab_id, session_id = %session_id, "Stats worker stopped");
}
