//! Per-client session state machine.
//!
//! Every client session runs as one task owning all of its mutable state;
//! detectors, REST handlers and the websocket feed it through an event
//! channel, so state transitions are serialized without any session-wide
//! lock being held across I/O. The task drives the avatar lifecycle
//! (`Idle → Connecting → AvatarReady ↔ Speaking`), arms and consumes the
//! speech recognizer, launches chat turns, and executes recovery sequences
//! the arbiter admits.

use super::arbiter::ReconnectArbiter;
use super::events::{AvatarState, ReconnectCause, SessionEvent, SessionSnapshot};
use super::relay::{ChatTurnContext, spawn_chat_turn};
use super::speaker::Speaker;
use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::protocol::{LatencyKind, PushMessage, SessionEventType};
use crate::stt::{RecognizerEvent, RecognizerFactory, SpeechRecognizer};
use crate::synthesis::{BoundConnection, LinkEvent, SessionParams, SynthesisControl, SynthesisService};
use anyhow::{Context, Result, anyhow};
use parley_core::chat::{ChatClient, ChatMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

/// Shared collaborators injected into every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub pool: Arc<ConnectionPool>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub chat: Arc<dyn ChatClient>,
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub config: Arc<Config>,
}

/// The channel ends a spawned session exposes to the rest of the gateway.
pub struct SpawnedSession {
    pub events: mpsc::Sender<SessionEvent>,
    pub outbound: mpsc::Receiver<PushMessage>,
    pub arbiter: ReconnectArbiter,
    pub alive: Arc<AtomicBool>,
    pub task: JoinHandle<()>,
}

pub struct ClientSession {
    id: Uuid,
    deps: SessionDeps,
    state: AvatarState,
    events_rx: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Sender<PushMessage>,
    reconnecting: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,

    last_interaction: Instant,
    ready_deadline: Option<Instant>,
    media_position: Option<u64>,

    session_params: Option<SessionParams>,
    control: Option<Arc<dyn SynthesisControl>>,
    link_task: Option<JoinHandle<()>>,
    link_epoch: u64,

    recognizer: Option<Box<dyn SpeechRecognizer>>,
    recognizer_task: Option<JoinHandle<()>>,
    recognition_started: Option<Instant>,

    speaker: Speaker,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    system_prompt: String,
    turn: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Spawns the session task for a new client.
    pub fn spawn(id: Uuid, deps: SessionDeps) -> SpawnedSession {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let reconnecting = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let arbiter = ReconnectArbiter::new(reconnecting.clone(), events_tx.clone());

        let session = Self {
            id,
            state: AvatarState::Idle,
            speaker: Speaker::new(deps.config.default_tts_voice.clone()),
            system_prompt: deps.config.system_prompt.clone(),
            deps,
            events_rx,
            events_tx: events_tx.clone(),
            outbound: outbound_tx,
            reconnecting: reconnecting.clone(),
            alive: alive.clone(),
            last_interaction: Instant::now(),
            ready_deadline: None,
            media_position: None,
            session_params: None,
            control: None,
            link_task: None,
            link_epoch: 0,
            recognizer: None,
            recognizer_task: None,
            recognition_started: None,
            history: Arc::new(Mutex::new(Vec::new())),
            turn: None,
        };

        let span = tracing::info_span!("client_session", client_id = %id);
        let task = tokio::spawn(session.run().instrument(span));

        SpawnedSession {
            events: events_tx,
            outbound: outbound_rx,
            arbiter,
            alive,
            task,
        }
    }

    async fn run(mut self) {
        info!("Session task started.");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        self.shutdown().await;
        info!("Session task finished.");
    }

    /// Returns `true` when the session reached its terminal state.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Start { params, reply } => {
                self.touch();
                if self.state == AvatarState::Ended {
                    let _ = reply.send(Err(anyhow!("Session has ended")));
                    return false;
                }
                self.apply_voice(&params);
                self.session_params = Some(*params);
                let result = self.connect(false).await;
                if let Err(e) = &result {
                    warn!(error = ?e, "Avatar connect failed.");
                    self.push_status("Could not connect the avatar. Please try again.")
                        .await;
                    self.enter_idle();
                }
                let _ = reply.send(result);
            }
            SessionEvent::DisconnectAvatar { reply } => {
                self.touch();
                self.speaker.stop(false).await;
                self.teardown_link().await;
                self.enter_idle();
                self.push_event(SessionEventType::SpeechSynthesizerDisconnected)
                    .await;
                let _ = reply.send(());
            }
            SessionEvent::ConnectRecognizer {
                system_prompt,
                reply,
            } => {
                self.touch();
                if let Some(prompt) = system_prompt {
                    self.system_prompt = prompt;
                }
                let _ = reply.send(self.arm_recognizer().await);
            }
            SessionEvent::DisconnectRecognizer { reply } => {
                self.disarm_recognizer().await;
                let _ = reply.send(());
            }
            SessionEvent::Audio(chunk) => {
                if let Some(recognizer) = &self.recognizer {
                    if let Err(e) = recognizer.push_audio(chunk).await {
                        warn!(error = ?e, "Dropping audio chunk.");
                    }
                }
            }
            SessionEvent::UserQuery {
                text,
                system_prompt,
            } => {
                self.touch();
                if let Some(prompt) = system_prompt {
                    self.system_prompt = prompt;
                }
                self.start_turn(text);
            }
            SessionEvent::SpeakSsml { ssml, reply } => {
                self.touch();
                match &self.control {
                    Some(control) => {
                        // Run outside the event loop so a long utterance
                        // cannot starve the session.
                        let control = control.clone();
                        tokio::spawn(async move {
                            let _ = reply.send(control.speak_ssml(&ssml).await);
                        });
                    }
                    None => {
                        let _ = reply.send(Err(anyhow!("Avatar is not connected")));
                    }
                }
            }
            SessionEvent::StopSpeaking => {
                self.touch();
                self.speaker.stop(false).await;
            }
            SessionEvent::ContinueSpeaking => {
                self.touch();
                self.speaker.continue_speaking(
                    self.deps
                        .config
                        .repeat_speaking_sentence_after_reconnection,
                );
            }
            SessionEvent::ClearHistory { system_prompt } => {
                self.touch();
                if let Some(prompt) = system_prompt {
                    self.system_prompt = prompt;
                }
                self.history.lock().await.clear();
            }
            SessionEvent::Reconnect(cause) => {
                // The arbiter's guard is already held on our behalf.
                self.recover(cause).await;
            }
            SessionEvent::Link { epoch, event } => {
                // Signals from a link that has since been torn down are
                // stale; acting on them would undo a newer bind.
                if epoch == self.link_epoch {
                    self.handle_link_event(event).await;
                }
            }
            SessionEvent::Recognizer(rec_event) => {
                self.handle_recognizer_event(rec_event).await;
            }
            SessionEvent::Query(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionEvent::End { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return true;
            }
        }
        false
    }

    async fn on_tick(&mut self) {
        // Grace delay after the media track starts flowing, so a
        // recognized-speech event arriving immediately afterwards cannot race
        // a half-initialized session.
        if self.state == AvatarState::Connecting {
            if let Some(deadline) = self.ready_deadline {
                if Instant::now() >= deadline {
                    self.promote_ready();
                }
            }
        }

        // Config-gated idle switch: give the bound connection back when the
        // avatar has had nothing to say for a while. The UI keeps its
        // idle-display mode; the disconnect is expected and must not look
        // like an outage.
        if self.deps.config.idle_disconnect
            && self.state.is_connected()
            && !self.speaker.is_speaking()
        {
            let idle_for = self.speaker.last_spoke().map(|t| t.elapsed());
            let interaction_idle = self.last_interaction.elapsed();
            if let Some(idle_for) = idle_for {
                if idle_for > self.deps.config.idle_switch_after
                    && interaction_idle > self.deps.config.idle_switch_after
                {
                    // Teardown detaches the watcher and invalidates queued
                    // link signals, so this deliberate disconnect never
                    // reaches the arbiter.
                    info!("Idle switch: releasing the avatar connection.");
                    self.teardown_link().await;
                    self.state = AvatarState::Disconnected;
                    self.push_event(SessionEventType::SpeechSynthesizerDisconnected)
                        .await;
                }
            }
        }
    }

    // --- Connection lifecycle ---------------------------------------------

    /// Acquires a pre-warmed connection and binds it. On success the session
    /// is left in `Connecting` awaiting the media-flowing signal.
    async fn connect(&mut self, is_reconnect: bool) -> Result<String> {
        let params = self
            .session_params
            .clone()
            .context("No avatar parameters for this session")?;

        let keep_queue =
            is_reconnect && self.deps.config.repeat_speaking_sentence_after_reconnection;
        self.speaker.stop(keep_queue).await;
        self.teardown_link().await;
        self.state = AvatarState::Connecting;
        self.ready_deadline = None;
        self.media_position = None;

        let pending = self.acquire_connection().await?;
        if !self.is_alive() {
            return Err(anyhow!("Session ended during connect"));
        }

        let bound = self
            .deps
            .synthesis
            .bind(pending, params)
            .await
            .context("Avatar handshake failed")?;
        if !self.is_alive() {
            let _ = bound.control.close().await;
            return Err(anyhow!("Session ended during connect"));
        }

        let remote_sdp = self.install_link(bound);
        self.push_event(SessionEventType::SpeechSynthesizerConnected)
            .await;
        if is_reconnect {
            self.push(PushMessage::AvatarSdp {
                remote_sdp: remote_sdp.clone(),
            })
            .await;
        }
        Ok(remote_sdp)
    }

    /// Polls the pool with backoff. The pool never blocks; exhausting the
    /// bounded attempts is a user-visible connect failure, not a process
    /// error.
    async fn acquire_connection(&self) -> Result<crate::synthesis::PendingConnection> {
        let attempts = self.deps.config.connect_retry_attempts.max(1);
        for attempt in 0..attempts {
            if !self.is_alive() {
                return Err(anyhow!("Session ended during connect"));
            }
            if let Some(conn) = self.deps.pool.take() {
                // Replace what we consumed.
                self.deps.pool.prepare_one();
                return Ok(conn);
            }
            self.deps.pool.prepare_one();
            if attempt + 1 < attempts {
                tokio::time::sleep(self.deps.config.connect_retry_backoff).await;
            }
        }
        Err(anyhow!(
            "No media connection became ready within {} attempts",
            attempts
        ))
    }

    /// Wires a bound link into the session: stores the control handle, hands
    /// it to the speaker, and starts the side-channel forwarder.
    fn install_link(&mut self, bound: BoundConnection) -> String {
        let BoundConnection {
            remote_sdp,
            mut events,
            control,
        } = bound;

        self.control = Some(control.clone());
        self.speaker.set_control(Some(control));
        self.link_epoch += 1;

        let epoch = self.link_epoch;
        let events_tx = self.events_tx.clone();
        self.link_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if events_tx
                    .send(SessionEvent::Link { epoch, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
        remote_sdp
    }

    /// Detaches the link watcher and closes the control handle. Aborting the
    /// watcher first is what unregisters the stale disconnect signal — a
    /// dying link must not keep firing into a session that already moved on.
    /// The epoch bump discards signals the watcher managed to enqueue before
    /// the abort.
    async fn teardown_link(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link_epoch += 1;
        self.speaker.set_control(None);
        if let Some(control) = self.control.take() {
            let _ = control.close().await;
        }
    }

    fn promote_ready(&mut self) {
        self.state = AvatarState::AvatarReady;
        self.ready_deadline = None;
        // Only now is the recovery window over; a second detector firing
        // before this point was deduplicated by the arbiter.
        self.reconnecting.store(false, Ordering::SeqCst);
        info!("Avatar ready.");
    }

    fn enter_idle(&mut self) {
        self.state = AvatarState::Idle;
        self.ready_deadline = None;
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                if self.state == AvatarState::Connecting {
                    self.ready_deadline =
                        Some(Instant::now() + self.deps.config.ready_grace);
                }
            }
            LinkEvent::SynthesisStarted => {
                if self.state.is_connected() {
                    self.state = AvatarState::Speaking;
                }
            }
            LinkEvent::SynthesisIdle => {
                if self.state == AvatarState::Speaking {
                    self.state = AvatarState::AvatarReady;
                }
            }
            LinkEvent::MediaPosition { position_ms } => {
                self.media_position = Some(position_ms);
            }
            LinkEvent::Disconnected => {
                self.push_event(SessionEventType::SpeechSynthesizerDisconnected)
                    .await;
                self.speaker.set_control(None);
                self.control = None;
                // The watcher exits on its own once the link closes.
                self.link_task.take();
                self.link_epoch += 1;

                if self.state == AvatarState::Ended {
                    return;
                }
                self.state = AvatarState::Disconnected;
                // Same compare-and-set the external detectors go through.
                if self
                    .reconnecting
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.recover(ReconnectCause::DataChannelClosed).await;
                }
            }
        }
    }

    /// One admitted recovery sequence. The reconnecting flag is already set;
    /// every exit path either ends in `Connecting` (the flag clears when the
    /// session re-reaches ready) or clears the flag itself.
    async fn recover(&mut self, cause: ReconnectCause) {
        if self.state == AvatarState::Ended || !self.is_alive() {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        if !self.deps.config.auto_reconnect {
            info!(?cause, "Auto-reconnect disabled; staying disconnected.");
            self.state = AvatarState::Disconnected;
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        // A session nobody has touched for too long is presumed abandoned;
        // reconnecting it would waste a pre-warmed connection.
        if self.last_interaction.elapsed() >= self.deps.config.reconnect_staleness {
            info!(?cause, "Reconnect suppressed: session is stale.");
            self.state = AvatarState::Disconnected;
            self.reconnecting.store(false, Ordering::SeqCst);
            self.push_event(SessionEventType::ReconnectSuppressed).await;
            return;
        }

        info!(?cause, "Reconnecting avatar.");
        self.push_event(SessionEventType::Reconnecting).await;
        match self.connect(true).await {
            Ok(_) => {
                // Now in Connecting; the grace timer finishes the recovery.
            }
            Err(e) => {
                error!(error = ?e, "Reconnect failed.");
                self.push_status("Could not reconnect the avatar. Please try again.")
                    .await;
                self.enter_idle();
            }
        }
    }

    // --- Recognizer --------------------------------------------------------

    async fn arm_recognizer(&mut self) -> Result<()> {
        self.disarm_recognizer().await;

        let mut recognizer = self.deps.recognizers.create();
        let mut events = recognizer.start(&self.deps.config.stt_locales).await?;

        let events_tx = self.events_tx.clone();
        self.recognizer_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if events_tx
                    .send(SessionEvent::Recognizer(event))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
        self.recognizer = Some(recognizer);
        self.recognition_started = Some(Instant::now());
        Ok(())
    }

    async fn disarm_recognizer(&mut self) {
        if let Some(task) = self.recognizer_task.take() {
            task.abort();
        }
        if let Some(mut recognizer) = self.recognizer.take() {
            if let Err(e) = recognizer.stop().await {
                warn!(error = ?e, "Recognizer stop failed.");
            }
            let _ = recognizer.close().await;
        }
        self.recognition_started = None;
    }

    async fn handle_recognizer_event(&mut self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Recognizing => {
                // Barge-in: the user started talking over the avatar.
                if self.speaker.is_speaking() {
                    self.speaker.stop(false).await;
                }
            }
            RecognizerEvent::Recognized {
                text,
                offset_ms,
                duration_ms,
            } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                self.touch();

                self.push(PushMessage::Chat {
                    chat_response: format!("\n\n {text}\n\n"),
                })
                .await;

                if let Some(started) = self.recognition_started {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let stt_latency =
                        elapsed_ms.saturating_sub(offset_ms + duration_ms);
                    info!(latency_ms = stt_latency, "Speech recognized.");
                    self.push(PushMessage::Latency {
                        kind: LatencyKind::SttLatency,
                        milliseconds: stt_latency,
                    })
                    .await;
                }

                self.start_turn(text);
            }
            RecognizerEvent::Canceled { reason } => {
                warn!(%reason, "Recognition canceled.");
                self.push_status("Speech recognition was interrupted.").await;
            }
        }
    }

    // --- Chat --------------------------------------------------------------

    /// Launches the relay for one turn. A query arriving while a turn is in
    /// flight interrupts it: the old response buffer is dropped with its
    /// task, keeping a single in-flight turn per session.
    fn start_turn(&mut self, user_query: String) {
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        let ctx = ChatTurnContext {
            chat: self.deps.chat.clone(),
            outbound: self.outbound.clone(),
            speaker: self.speaker.clone(),
            history: self.history.clone(),
            system_prompt: self.system_prompt.clone(),
            quiet_period: self.deps.config.chat_quiet_period,
        };
        self.turn = Some(spawn_chat_turn(ctx, user_query));
    }

    // --- Bookkeeping -------------------------------------------------------

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            speech_synthesizer_connected: self
                .control
                .as_ref()
                .map(|c| c.is_open())
                .unwrap_or(false),
            reconnecting: self.reconnecting.load(Ordering::SeqCst),
            is_speaking: self.state == AvatarState::Speaking || self.speaker.is_speaking(),
            idle_seconds: self.last_interaction.elapsed().as_secs(),
            media_position_ms: self.media_position,
            seconds_since_last_spoke: self.speaker.last_spoke().map(|t| t.elapsed().as_secs()),
        }
    }

    fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn apply_voice(&self, params: &SessionParams) {
        let voice = params
            .avatar
            .tts_voice
            .clone()
            .unwrap_or_else(|| self.deps.config.default_tts_voice.clone());
        self.speaker.set_voice(
            voice,
            params.avatar.personal_voice_speaker_profile_id.clone(),
        );
    }

    async fn push(&self, msg: PushMessage) {
        let _ = self.outbound.send(msg).await;
    }

    async fn push_event(&self, event_type: SessionEventType) {
        self.push(PushMessage::Event { event_type }).await;
    }

    async fn push_status(&self, message: &str) {
        self.push(PushMessage::Status {
            message: message.to_string(),
        })
        .await;
    }

    async fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state = AvatarState::Ended;
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        self.speaker.stop(false).await;
        self.teardown_link().await;
        self.disarm_recognizer().await;
        self.push_event(SessionEventType::SessionEnded).await;
        self.reconnecting.store(false, Ordering::SeqCst);
        info!(client_id = %self.id, "Session ended.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AvatarParams;
    use crate::synthesis::{PendingConnection, SynthesisTransport};
    use crate::test_support::test_config;
    use anyhow::bail;
    use async_trait::async_trait;
    use parley_core::chat::ScriptedChatClient;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    // -- Mock collaborators --

    struct NullTransport;

    #[async_trait]
    impl SynthesisTransport for NullTransport {
        async fn handshake(
            self: Box<Self>,
            _config_context: serde_json::Value,
        ) -> Result<BoundConnection> {
            bail!("not used: the mock service binds without a transport")
        }
    }

    struct MockControl {
        open: AtomicBool,
    }

    #[async_trait]
    impl SynthesisControl for MockControl {
        async fn speak_ssml(&self, _ssml: &str) -> Result<String> {
            Ok("mock-result".into())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    /// Synthesis service whose binds succeed instantly and whose link event
    /// senders are retained so tests can inject disconnects.
    struct MockSynthesis {
        binds: AtomicUsize,
        links: StdMutex<Vec<mpsc::Sender<LinkEvent>>>,
    }

    impl MockSynthesis {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                binds: AtomicUsize::new(0),
                links: StdMutex::new(Vec::new()),
            })
        }

        fn bind_count(&self) -> usize {
            self.binds.load(Ordering::SeqCst)
        }

        async fn drop_link(&self, index: usize) {
            let tx = self.links.lock().unwrap()[index].clone();
            let _ = tx.send(LinkEvent::Disconnected).await;
        }
    }

    #[async_trait]
    impl SynthesisService for MockSynthesis {
        async fn begin_negotiation(&self) -> Result<PendingConnection> {
            Ok(PendingConnection::new(vec![], Box::new(NullTransport)))
        }

        async fn bind(
            &self,
            _conn: PendingConnection,
            _params: SessionParams,
        ) -> Result<BoundConnection> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            tx.send(LinkEvent::Connected).await.unwrap();
            self.links.lock().unwrap().push(tx);
            Ok(BoundConnection {
                remote_sdp: "v=0 mock-answer".into(),
                events: rx,
                control: Arc::new(MockControl {
                    open: AtomicBool::new(true),
                }),
            })
        }
    }

    struct NoRecognizers;

    impl RecognizerFactory for NoRecognizers {
        fn create(&self) -> Box<dyn SpeechRecognizer> {
            unimplemented!("these tests never arm a recognizer")
        }
    }

    fn deps(synthesis: Arc<MockSynthesis>, config: Arc<Config>) -> SessionDeps {
        let pool = Arc::new(ConnectionPool::new(
            synthesis.clone(),
            config.pool_capacity,
            config.pool_stale_after,
            config.negotiation_timeout,
        ));
        SessionDeps {
            pool,
            synthesis,
            chat: Arc::new(ScriptedChatClient::new()),
            recognizers: Arc::new(NoRecognizers),
            config,
        }
    }

    fn start_params() -> SessionParams {
        SessionParams {
            client_sdp: "v=0 browser-offer".into(),
            avatar: AvatarParams {
                character: "lisa".into(),
                style: "casual-sitting".into(),
                background_color: "#FFFFFFFF".into(),
                ..AvatarParams::default()
            },
        }
    }

    async fn start(session: &SpawnedSession) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        session
            .events
            .send(SessionEvent::Start {
                params: Box::new(start_params()),
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn snapshot(session: &SpawnedSession) -> SessionSnapshot {
        let (reply, rx) = oneshot::channel();
        session
            .events
            .send(SessionEvent::Query(reply))
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn wait_for_state(session: &SpawnedSession, state: AvatarState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if snapshot(session).await.state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {state:?}"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_connects_and_reaches_ready_after_grace() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| c.ready_grace = Duration::from_millis(50));
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        let remote_sdp = start(&session).await.unwrap();
        assert_eq!(remote_sdp, "v=0 mock-answer");

        let snap = snapshot(&session).await;
        assert_eq!(snap.state, AvatarState::Connecting);
        assert!(snap.speech_synthesizer_connected);

        wait_for_state(&session, AvatarState::AvatarReady).await;
        assert!(!snapshot(&session).await.reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_disconnect_triggers_one_reconnect() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| c.ready_grace = Duration::from_millis(10));
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        start(&session).await.unwrap();
        wait_for_state(&session, AvatarState::AvatarReady).await;
        assert_eq!(synthesis.bind_count(), 1);

        synthesis.drop_link(0).await;
        wait_for_state(&session, AvatarState::AvatarReady).await;
        assert_eq!(synthesis.bind_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_detectors_produce_a_single_recovery() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| c.ready_grace = Duration::from_millis(10));
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        start(&session).await.unwrap();
        wait_for_state(&session, AvatarState::AvatarReady).await;

        // A link drop and two polling detectors all notice within the same
        // instant.
        synthesis.drop_link(0).await;
        session
            .arbiter
            .request_reconnect(ReconnectCause::SynthesizerLinkClosed);
        session.arbiter.request_reconnect(ReconnectCause::VideoFrozen);

        wait_for_state(&session, AvatarState::AvatarReady).await;
        // One initial bind plus exactly one recovery bind.
        assert_eq!(synthesis.bind_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_never_auto_reconnects() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| {
            c.ready_grace = Duration::from_millis(10);
            c.reconnect_staleness = Duration::from_millis(0);
        });
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        start(&session).await.unwrap();
        wait_for_state(&session, AvatarState::AvatarReady).await;

        synthesis.drop_link(0).await;
        wait_for_state(&session, AvatarState::Disconnected).await;

        // Give any would-be recovery ample time, then confirm none happened.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(synthesis.bind_count(), 1);
        assert!(!snapshot(&session).await.reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_reconnect_stays_disconnected() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| {
            c.ready_grace = Duration::from_millis(10);
            c.auto_reconnect = false;
        });
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        start(&session).await.unwrap();
        wait_for_state(&session, AvatarState::AvatarReady).await;

        synthesis.drop_link(0).await;
        wait_for_state(&session, AvatarState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(synthesis.bind_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_is_terminal() {
        let synthesis = MockSynthesis::new();
        let config = test_config(|c| c.ready_grace = Duration::from_millis(10));
        let session = ClientSession::spawn(Uuid::new_v4(), deps(synthesis.clone(), config));

        start(&session).await.unwrap();
        wait_for_state(&session, AvatarState::AvatarReady).await;

        session.alive.store(false, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        session
            .events
            .send(SessionEvent::End { reply: Some(reply) })
            .await
            .unwrap();
        rx.await.unwrap();

        // The event channel closes once the task finishes.
        tokio::time::timeout(Duration::from_secs(1), session.events.closed())
            .await
            .unwrap();
    }
}
