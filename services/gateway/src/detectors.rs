//! Background detectors.
//!
//! Independent periodic tasks that watch the whole process: pool pre-warming,
//! idle-session eviction, a status poll for silently closed synthesizer
//! links, and a freeze probe comparing media positions between rounds. None
//! of them mutates session state directly — recovery always goes through the
//! session's reconnection arbiter, and snapshots are fetched over the event
//! channel, so no session lock is ever held across I/O here.

use crate::session::events::ReconnectCause;
use crate::state::AppState;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Spawns every detector task for the lifetime of the process.
pub fn spawn_all(state: Arc<AppState>) {
    spawn_prewarm(state.clone());
    spawn_idle_sweep(state.clone());
    spawn_status_poll(state.clone());
    spawn_freeze_probe(state);
}

/// Keeps the connection pool primed up to its capacity.
fn spawn_prewarm(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.prewarm_interval);
        loop {
            tick.tick().await;
            let missing = state
                .pool
                .capacity()
                .saturating_sub(state.pool.len());
            for _ in 0..missing {
                state.pool.prepare_one();
            }
        }
    });
}

/// Evicts sessions idle beyond the configured bound, and nudges sessions
/// that dropped their link while nothing else was watching.
fn spawn_idle_sweep(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.idle_sweep_interval);
        loop {
            tick.tick().await;
            state
                .registry
                .evict_idle(state.config.session_max_idle)
                .await;

            if !state.config.auto_reconnect {
                continue;
            }
            for client_id in state.registry.ids().await {
                let Some(handle) = state.registry.get(client_id).await else {
                    continue;
                };
                let Some(snapshot) = handle.query().await else {
                    continue;
                };
                let recent = std::time::Duration::from_secs(snapshot.idle_seconds)
                    < state.config.reconnect_staleness;
                if snapshot.state == crate::session::AvatarState::Disconnected
                    && !snapshot.reconnecting
                    && recent
                {
                    debug!(%client_id, "Idle sweep found a dropped link.");
                    handle.arbiter.request_reconnect(ReconnectCause::IdleTimeout);
                }
            }
        }
    });
}

/// Detects synthesizer links that closed without a disconnect signal.
fn spawn_status_poll(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.status_poll_interval);
        loop {
            tick.tick().await;
            for client_id in state.registry.ids().await {
                let Some(handle) = state.registry.get(client_id).await else {
                    continue;
                };
                let Some(snapshot) = handle.query().await else {
                    continue;
                };
                if snapshot.state.is_connected()
                    && !snapshot.speech_synthesizer_connected
                    && !snapshot.reconnecting
                {
                    info!(%client_id, "Status poll found the synthesizer link closed.");
                    handle
                        .arbiter
                        .request_reconnect(ReconnectCause::SynthesizerLinkClosed);
                }
            }
        }
    });
}

/// Detects frozen video: a speaking session whose reported media position
/// did not advance between two probes.
fn spawn_freeze_probe(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.freeze_probe_interval);
        let mut last_positions: HashMap<Uuid, u64> = HashMap::new();
        loop {
            tick.tick().await;
            let mut seen = HashMap::new();
            for client_id in state.registry.ids().await {
                let Some(handle) = state.registry.get(client_id).await else {
                    continue;
                };
                let Some(snapshot) = handle.query().await else {
                    continue;
                };
                let Some(position) = snapshot.media_position_ms else {
                    continue;
                };
                if snapshot.is_speaking && !snapshot.reconnecting {
                    if last_positions.get(&client_id) == Some(&position) {
                        info!(%client_id, position, "Freeze probe found stalled media.");
                        handle.arbiter.request_reconnect(ReconnectCause::VideoFrozen);
                        continue;
                    }
                }
                seen.insert(client_id, position);
            }
            last_positions = seen;
        }
    });
}
