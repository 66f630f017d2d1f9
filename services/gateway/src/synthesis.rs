//! Synthesis service boundary: media negotiation and the avatar link.
//!
//! The avatar's video/audio is produced by a remote speech-synthesis service
//! reached over a websocket. Negotiation happens in two steps that this module
//! keeps deliberately separate so connections can be pre-warmed:
//!
//! 1. `begin_negotiation` produces a [`PendingConnection`] — relay credentials
//!    resolved and a service socket opened, but no client bound to it yet.
//!    These live in the connection pool until a session claims one.
//! 2. `bind` attaches a client: the avatar configuration (client SDP, relay
//!    servers, character, video format) is sent as the `speech.config`
//!    context message, an empty synthesis turn forces the service to answer
//!    with the remote SDP, and the socket becomes a [`BoundConnection`] with a
//!    side-channel event stream and a control handle.

use crate::models::AvatarParams;
use crate::tokens::{IceServer, TokenCache};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::info;
use uuid::Uuid;

/// Everything needed to bind one client to a pre-warmed connection.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// The browser's local SDP, relayed verbatim into the handshake.
    pub client_sdp: String,
    pub avatar: AvatarParams,
}

/// Side-channel signals from a bound synthesis link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The media track is flowing.
    Connected,
    /// The avatar started speaking.
    SynthesisStarted,
    /// The avatar went idle.
    SynthesisIdle,
    /// Playback position report, used by the freeze probe.
    MediaPosition { position_ms: u64 },
    /// The service closed the link.
    Disconnected,
}

/// Control operations on a bound link.
#[async_trait]
pub trait SynthesisControl: Send + Sync {
    /// Speaks one SSML document to completion, returning the service's
    /// result id.
    async fn speak_ssml(&self, ssml: &str) -> Result<String>;
    /// Interrupts the current utterance.
    async fn stop(&self) -> Result<()>;
    /// Closes the link.
    async fn close(&self) -> Result<()>;
    /// Whether the link is still open.
    fn is_open(&self) -> bool;
}

/// A media connection that finished local negotiation but has no client yet.
///
/// Owned by the connection pool until handed to exactly one session.
pub struct PendingConnection {
    pub id: Uuid,
    pub ice_servers: Vec<IceServer>,
    pub ready_at: Instant,
    transport: Box<dyn SynthesisTransport>,
}

impl PendingConnection {
    pub fn new(ice_servers: Vec<IceServer>, transport: Box<dyn SynthesisTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ice_servers,
            ready_at: Instant::now(),
            transport,
        }
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("id", &self.id)
            .field("ready_at", &self.ready_at)
            .finish_non_exhaustive()
    }
}

/// A pre-opened service socket awaiting its configuration handshake.
#[async_trait]
pub trait SynthesisTransport: Send {
    async fn handshake(self: Box<Self>, config_context: serde_json::Value) -> Result<BoundConnection>;
}

/// A synthesis link bound to one client session.
pub struct BoundConnection {
    /// The service's SDP answer, relayed back to the browser.
    pub remote_sdp: String,
    /// Side-channel events; closed when the link dies.
    pub events: mpsc::Receiver<LinkEvent>,
    pub control: Arc<dyn SynthesisControl>,
}

/// The negotiation/binding boundary consumed by the pool and the sessions.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Starts a fresh negotiation. Resolves once all relay credentials are
    /// gathered and the service socket is open, or fails.
    async fn begin_negotiation(&self) -> Result<PendingConnection>;
    /// Binds a pre-warmed connection to a client.
    async fn bind(&self, conn: PendingConnection, params: SessionParams) -> Result<BoundConnection>;
}

// --- Remote implementation -------------------------------------------------

/// `SynthesisService` backed by the real speech-synthesis websocket.
pub struct TtsSynthesisService {
    region: String,
    tokens: TokenCache,
}

impl TtsSynthesisService {
    pub fn new(region: String, tokens: TokenCache) -> Self {
        Self { region, tokens }
    }

    fn endpoint(&self) -> String {
        format!(
            "wss://{}.tts.speech.microsoft.com/cognitiveservices/websocket/v1?enableTalkingAvatar=true",
            self.region
        )
    }
}

#[async_trait]
impl SynthesisService for TtsSynthesisService {
    async fn begin_negotiation(&self) -> Result<PendingConnection> {
        let ice = self
            .tokens
            .ice_server()
            .context("Relay credentials not available yet")?;
        let token = self
            .tokens
            .speech_token()
            .context("Speech token not available yet")?;

        let mut request = self.endpoint().into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse()?);

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to open synthesis websocket")?;
        info!("Synthesis websocket opened for pre-warm.");

        Ok(PendingConnection::new(
            vec![ice],
            Box::new(WsTransport { stream }),
        ))
    }

    async fn bind(&self, conn: PendingConnection, params: SessionParams) -> Result<BoundConnection> {
        let context = avatar_config(&params, &conn.ice_servers);
        conn.transport.handshake(context).await
    }
}

/// Builds the `speech.config` context payload for one client.
fn avatar_config(params: &SessionParams, ice_servers: &[IceServer]) -> serde_json::Value {
    let avatar = &params.avatar;
    let (crop_left, crop_right) = if avatar.video_crop { (600, 1320) } else { (0, 1920) };
    let background_color = if avatar.transparent_background {
        "#00FF00FF"
    } else {
        avatar.background_color.as_str()
    };
    json!({
        "synthesis": {
            "video": {
                "protocol": {
                    "name": "WebRTC",
                    "webrtcConfig": {
                        "clientDescription": params.client_sdp,
                        "iceServers": ice_servers.iter().map(|s| json!({
                            "urls": s.urls,
                            "username": s.username,
                            "credential": s.credential,
                        })).collect::<Vec<_>>(),
                    },
                },
                "format": {
                    "crop": {
                        "topLeft": { "x": crop_left, "y": 0 },
                        "bottomRight": { "x": crop_right, "y": 1080 },
                    },
                    "bitrate": 1_000_000,
                },
                "talkingAvatar": {
                    "customized": avatar.is_custom_avatar,
                    "character": avatar.character,
                    "style": avatar.style,
                    "background": {
                        "color": background_color,
                        "image": { "url": avatar.background_image_url },
                    },
                },
            },
        },
    })
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl SynthesisTransport for WsTransport {
    async fn handshake(self: Box<Self>, config_context: serde_json::Value) -> Result<BoundConnection> {
        let (mut tx, mut rx) = self.stream.split();

        let config_msg = json!({ "path": "speech.config", "context": config_context });
        tx.send(WsMessage::Text(config_msg.to_string().into()))
            .await
            .context("Failed to send speech.config")?;

        // An empty synthesis turn forces the service to start the media
        // session and answer with the remote SDP.
        let probe = json!({ "path": "ssml", "ssml": "" });
        tx.send(WsMessage::Text(probe.to_string().into())).await?;

        let remote_sdp = loop {
            let msg = rx
                .next()
                .await
                .context("Synthesis socket closed during handshake")??;
            if let WsMessage::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                match value.get("path").and_then(|p| p.as_str()) {
                    Some("turn.start") => {
                        let sdp = value
                            .pointer("/webrtc/connectionString")
                            .and_then(|v| v.as_str())
                            .context("turn.start carried no connection string")?;
                        break sdp.to_string();
                    }
                    Some("error") => {
                        bail!(
                            "Synthesis handshake rejected: {}",
                            value.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
                        )
                    }
                    _ => continue,
                }
            }
        };

        let (event_tx, event_rx) = mpsc::channel(64);
        let (control_tx, mut control_rx) = mpsc::channel::<WsMessage>(16);
        let open = Arc::new(AtomicBool::new(true));
        let acks: Arc<Mutex<VecDeque<oneshot::Sender<String>>>> =
            Arc::new(Mutex::new(VecDeque::new()));

        // Writer half: control messages out.
        tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = tx.close().await;
        });

        // Reader half: side-channel events in.
        {
            let event_tx = event_tx.clone();
            let open = open.clone();
            let acks = acks.clone();
            tokio::spawn(async move {
                while let Some(Ok(msg)) = rx.next().await {
                    let WsMessage::Text(text) = msg else { continue };
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    let event = match value.get("path").and_then(|p| p.as_str()) {
                        Some("turn.start") => Some(LinkEvent::Connected),
                        Some("synthesis.started") => Some(LinkEvent::SynthesisStarted),
                        Some("synthesis.idle") => Some(LinkEvent::SynthesisIdle),
                        Some("media.position") => value
                            .get("positionMs")
                            .and_then(|p| p.as_u64())
                            .map(|position_ms| LinkEvent::MediaPosition { position_ms }),
                        Some("turn.end") => {
                            let result_id = value
                                .get("resultId")
                                .and_then(|r| r.as_str())
                                .unwrap_or_default()
                                .to_string();
                            if let Some(ack) =
                                acks.lock().expect("ack queue poisoned").pop_front()
                            {
                                let _ = ack.send(result_id);
                            }
                            None
                        }
                        Some("session.end") => {
                            open.store(false, Ordering::SeqCst);
                            let _ = event_tx.send(LinkEvent::Disconnected).await;
                            break;
                        }
                        _ => None,
                    };
                    if let Some(event) = event {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                // Socket died without a session.end message.
                if open.swap(false, Ordering::SeqCst) {
                    let _ = event_tx.send(LinkEvent::Disconnected).await;
                }
            });
        }

        // The service reports readiness right after the handshake turn.
        let _ = event_tx.send(LinkEvent::Connected).await;

        Ok(BoundConnection {
            remote_sdp,
            events: event_rx,
            control: Arc::new(WsControl { control_tx, open, acks }),
        })
    }
}

struct WsControl {
    control_tx: mpsc::Sender<WsMessage>,
    open: Arc<AtomicBool>,
    acks: Arc<Mutex<VecDeque<oneshot::Sender<String>>>>,
}

#[async_trait]
impl SynthesisControl for WsControl {
    async fn speak_ssml(&self, ssml: &str) -> Result<String> {
        if !self.is_open() {
            bail!("Synthesis link is closed");
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks.lock().expect("ack queue poisoned").push_back(ack_tx);

        let msg = json!({ "path": "ssml", "ssml": ssml });
        self.control_tx
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .map_err(|_| anyhow!("Synthesis link writer is gone"))?;

        ack_rx
            .await
            .map_err(|_| anyhow!("Synthesis link closed before the turn completed"))
    }

    async fn stop(&self) -> Result<()> {
        let msg = json!({ "path": "synthesis.control", "action": "stop" });
        self.control_tx
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .map_err(|_| anyhow!("Synthesis link writer is gone"))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.control_tx.send(WsMessage::Close(None)).await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// --- SSML ------------------------------------------------------------------

/// Builds the SSML document for one spoken sentence.
pub fn build_ssml(
    text: &str,
    voice: &str,
    speaker_profile_id: Option<&str>,
    ending_silence_ms: u64,
) -> String {
    let ending_break = if ending_silence_ms > 0 {
        format!("<break time='{ending_silence_ms}ms' />")
    } else {
        String::new()
    };
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' \
         xmlns:mstts='http://www.w3.org/2001/mstts' xml:lang='en-US'>\
         <voice name='{voice}'>\
         <mstts:ttsembedding speakerProfileId='{profile}'>\
         <mstts:leadingsilence-exact value='0'/>{text}{ending_break}\
         </mstts:ttsembedding></voice></speak>",
        profile = speaker_profile_id.unwrap_or(""),
        text = escape_xml(text),
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
