//! Client session registry.
//!
//! The process-wide map from client id to running session. Components get
//! session access by lookup here instead of through ambient globals; the map
//! itself is the only thing the lock guards — session state lives behind each
//! session's event channel, and no I/O ever happens while the registry lock
//! is held.

use crate::protocol::PushMessage;
use crate::session::arbiter::ReconnectArbiter;
use crate::session::events::{SessionEvent, SessionSnapshot};
use crate::session::machine::{ClientSession, SessionDeps, SpawnedSession};
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

/// The channel ends other components use to talk to one session.
pub struct SessionHandle {
    pub client_id: Uuid,
    events: mpsc::Sender<SessionEvent>,
    pub arbiter: ReconnectArbiter,
    alive: Arc<AtomicBool>,
    /// The push-channel receiver, parked here until a websocket attaches.
    outbound: StdMutex<Option<mpsc::Receiver<PushMessage>>>,
}

impl SessionHandle {
    /// Delivers one event to the session task.
    pub async fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("Session {} is gone", self.client_id))
    }

    /// Round-trips a snapshot request. `None` means the session task died.
    pub async fn query(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionEvent::Query(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Claims the push-channel receiver for a websocket connection. Only one
    /// socket may be attached at a time.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<PushMessage>> {
        self.outbound.lock().expect("outbound lock poisoned").take()
    }

    /// Returns the receiver when a socket detaches, so undelivered messages
    /// survive a network flap and the client can re-attach in order.
    pub fn restore_outbound(&self, receiver: mpsc::Receiver<PushMessage>) {
        *self.outbound.lock().expect("outbound lock poisoned") = Some(receiver);
    }

    /// Terminates the session. Setting the liveness flag first lets an
    /// in-flight reconnect sequence notice and abandon itself after its
    /// current I/O step, before the End event is even dequeued.
    pub async fn end(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        if self
            .send(SessionEvent::End { reply: Some(reply) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct Registry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    deps: SessionDeps,
}

impl Registry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            deps,
        }
    }

    /// Creates a new client session and spawns its task.
    pub async fn create(&self) -> Arc<SessionHandle> {
        let client_id = Uuid::new_v4();
        let SpawnedSession {
            events,
            outbound,
            arbiter,
            alive,
            task: _task,
        } = ClientSession::spawn(client_id, self.deps.clone());

        let handle = Arc::new(SessionHandle {
            client_id,
            events,
            arbiter,
            alive,
            outbound: StdMutex::new(Some(outbound)),
        });
        self.sessions
            .write()
            .await
            .insert(client_id, handle.clone());
        info!(%client_id, "Client session created.");
        handle
    }

    pub async fn get(&self, client_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&client_id).cloned()
    }

    /// Removes a session and drives it to its terminal state.
    pub async fn remove(&self, client_id: Uuid) -> bool {
        let handle = self.sessions.write().await.remove(&client_id);
        match handle {
            Some(handle) => {
                handle.end().await;
                info!(%client_id, "Client session released.");
                true
            }
            None => false,
        }
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evicts sessions idle beyond `max_idle`. Snapshots are taken without
    /// holding the registry lock.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        for client_id in self.ids().await {
            let Some(handle) = self.get(client_id).await else {
                continue;
            };
            match handle.query().await {
                Some(snapshot) if Duration::from_secs(snapshot.idle_seconds) < max_idle => {}
                // Idle too long, or the task is already dead.
                _ => {
                    if self.remove(client_id).await {
                        evicted += 1;
                    }
                }
            }
        }
        if evicted > 0 {
            info!(evicted, "Idle sessions evicted.");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use crate::stt::{RecognizerFactory, SpeechRecognizer};
    use crate::synthesis::{
        BoundConnection, PendingConnection, SessionParams, SynthesisService,
    };
    use crate::test_support::test_config;
    use async_trait::async_trait;
    use parley_core::chat::ScriptedChatClient;

    struct OfflineSynthesis;

    #[async_trait]
    impl SynthesisService for OfflineSynthesis {
        async fn begin_negotiation(&self) -> Result<PendingConnection> {
            anyhow::bail!("offline")
        }
        async fn bind(
            &self,
            _conn: PendingConnection,
            _params: SessionParams,
        ) -> Result<BoundConnection> {
            anyhow::bail!("offline")
        }
    }

    struct NoRecognizers;

    impl RecognizerFactory for NoRecognizers {
        fn create(&self) -> Box<dyn SpeechRecognizer> {
            unimplemented!("registry tests never arm a recognizer")
        }
    }

    fn registry() -> Registry {
        let config = test_config(|_| {});
        let synthesis = Arc::new(OfflineSynthesis);
        let pool = Arc::new(ConnectionPool::new(
            synthesis.clone(),
            config.pool_capacity,
            config.pool_stale_after,
            config.negotiation_timeout,
        ));
        Registry::new(SessionDeps {
            pool,
            synthesis,
            chat: Arc::new(ScriptedChatClient::new()),
            recognizers: Arc::new(NoRecognizers),
            config,
        })
    }

    #[tokio::test]
    async fn create_then_lookup_round_trips() {
        let registry = registry();
        let handle = registry.create().await;

        let found = registry.get(handle.client_id).await.expect("just created");
        assert_eq!(found.client_id, handle.client_id);
        assert!(found.query().await.is_some());
    }

    #[tokio::test]
    async fn unknown_id_is_absent() {
        let registry = registry();
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn remove_terminates_the_session() {
        let registry = registry();
        let handle = registry.create().await;
        let client_id = handle.client_id;

        assert!(registry.remove(client_id).await);
        assert!(registry.get(client_id).await.is_none());
        assert!(!handle.is_alive());
        assert!(!registry.remove(client_id).await, "second remove is a no-op");
    }

    #[tokio::test]
    async fn outbound_receiver_is_exclusive_until_restored() {
        let registry = registry();
        let handle = registry.create().await;

        let receiver = handle.take_outbound().expect("first take succeeds");
        assert!(handle.take_outbound().is_none(), "second socket is rejected");

        handle.restore_outbound(receiver);
        assert!(handle.take_outbound().is_some());
    }

    #[tokio::test]
    async fn fresh_sessions_survive_the_idle_sweep() {
        let registry = registry();
        registry.create().await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let registry = registry();
        registry.create().await;
        registry.create().await;

        // A zero bound makes every session count as idle.
        assert_eq!(registry.evict_idle(Duration::from_secs(0)).await, 2);
        assert!(registry.is_empty().await);
    }
}
