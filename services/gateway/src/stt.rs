//! Speech recognition boundary.
//!
//! Each session owns at most one recognizer. The gateway feeds it raw browser
//! audio and consumes `Recognizing`/`Recognized` events; recognized phrases
//! become chat turns. The recognizer is an opaque remote service — only its
//! lifecycle (`start`/`stop`/`close`) and its event shape are our concern.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{info, warn};

/// Events emitted by an armed recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Interim hypothesis: the user is mid-utterance.
    Recognizing,
    /// A finalized phrase. Offsets are relative to recognition start.
    Recognized {
        text: String,
        offset_ms: u64,
        duration_ms: u64,
    },
    /// The service aborted recognition.
    Canceled { reason: String },
}

/// One continuous-recognition instance, exclusively owned by a session.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begins continuous recognition and returns the event stream.
    async fn start(&mut self, locales: &[String]) -> Result<mpsc::Receiver<RecognizerEvent>>;
    /// Feeds one chunk of PCM16 audio.
    async fn push_audio(&self, audio: Bytes) -> Result<()>;
    /// Stops continuous recognition, keeping the instance reusable.
    async fn stop(&mut self) -> Result<()>;
    /// Tears the instance down.
    async fn close(&mut self) -> Result<()>;
}

/// Creates recognizer instances; injected so tests can substitute their own.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self) -> Box<dyn SpeechRecognizer>;
}

// --- Remote implementation -------------------------------------------------

/// Recognizer backed by the speech service's universal websocket endpoint.
pub struct WsSpeechRecognizer {
    region: String,
    key: String,
    audio_tx: Option<mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsSpeechRecognizer {
    pub fn new(region: String, key: String) -> Self {
        Self {
            region,
            key,
            audio_tx: None,
            tasks: Vec::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "wss://{}.stt.speech.microsoft.com/speech/universal/v2",
            self.region
        )
    }

    fn shutdown_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.audio_tx = None;
    }
}

#[async_trait]
impl SpeechRecognizer for WsSpeechRecognizer {
    async fn start(&mut self, locales: &[String]) -> Result<mpsc::Receiver<RecognizerEvent>> {
        if self.audio_tx.is_some() {
            return Err(anyhow!("Recognizer is already started"));
        }

        let mut request = self.endpoint().into_client_request()?;
        request
            .headers_mut()
            .insert("Ocp-Apim-Subscription-Key", self.key.parse()?);

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to open recognition websocket")?;
        let (mut ws_tx, mut ws_rx) = stream.split();
        info!(?locales, "Recognition session started.");

        let config = json!({ "path": "speech.config", "locales": locales });
        ws_tx
            .send(WsMessage::Text(config.to_string().into()))
            .await
            .context("Failed to send recognition config")?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(128);
        let (event_tx, event_rx) = mpsc::channel(64);

        // Writer: raw audio out as binary frames.
        self.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if ws_tx.send(WsMessage::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }));

        // Reader: recognition events in.
        self.tasks.push(tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                let event = match value.get("path").and_then(|p| p.as_str()) {
                    Some("speech.hypothesis") => Some(RecognizerEvent::Recognizing),
                    Some("speech.phrase") => {
                        let text = value
                            .get("displayText")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let offset_ms =
                            value.get("offsetMs").and_then(|v| v.as_u64()).unwrap_or(0);
                        let duration_ms =
                            value.get("durationMs").and_then(|v| v.as_u64()).unwrap_or(0);
                        Some(RecognizerEvent::Recognized {
                            text,
                            offset_ms,
                            duration_ms,
                        })
                    }
                    Some("speech.canceled") => {
                        let reason = value
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        warn!(%reason, "Recognition canceled by the service.");
                        Some(RecognizerEvent::Canceled { reason })
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }));

        self.audio_tx = Some(audio_tx);
        Ok(event_rx)
    }

    async fn push_audio(&self, audio: Bytes) -> Result<()> {
        let tx = self
            .audio_tx
            .as_ref()
            .context("Recognizer is not started")?;
        tx.send(audio)
            .await
            .map_err(|_| anyhow!("Recognition audio channel is closed"))
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown_tasks();
        info!("Recognition session stopped.");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown_tasks();
        Ok(())
    }
}

/// Factory for the websocket-backed recognizer.
pub struct WsRecognizerFactory {
    pub region: String,
    pub key: String,
}

impl RecognizerFactory for WsRecognizerFactory {
    fn create(&self) -> Box<dyn SpeechRecognizer> {
        Box::new(WsSpeechRecognizer::new(
            self.region.clone(),
            self.key.clone(),
        ))
    }
}
