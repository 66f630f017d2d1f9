//! Event and state types for the per-session state machine.

use crate::models::StatusResponse;
use crate::stt::RecognizerEvent;
use crate::synthesis::{LinkEvent, SessionParams};
use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

/// Lifecycle states of one client's avatar connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarState {
    Idle,
    Connecting,
    AvatarReady,
    Speaking,
    Disconnected,
    Ended,
}

impl AvatarState {
    pub fn as_str(self) -> &'static str {
        match self {
            AvatarState::Idle => "idle",
            AvatarState::Connecting => "connecting",
            AvatarState::AvatarReady => "avatar_ready",
            AvatarState::Speaking => "speaking",
            AvatarState::Disconnected => "disconnected",
            AvatarState::Ended => "ended",
        }
    }

    /// States with a live media link that a disconnect can interrupt.
    pub fn is_connected(self) -> bool {
        matches!(self, AvatarState::AvatarReady | AvatarState::Speaking)
    }
}

/// Why a recovery sequence was requested. Several independent detectors can
/// observe the same outage; the cause records which one won the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectCause {
    /// The link's own disconnect signal fired.
    DataChannelClosed,
    /// The periodic status poll found the synthesizer link closed.
    SynthesizerLinkClosed,
    /// The freeze probe saw no progress in the media position.
    VideoFrozen,
    /// The idle sweep found a session sitting disconnected.
    IdleTimeout,
}

/// Everything that can happen to a session, serialized through its event
/// channel. All state transitions run on the session's own task.
#[derive(Debug)]
pub enum SessionEvent {
    /// Begin (or re-begin) the avatar connection. Replies with the remote SDP.
    Start {
        params: Box<SessionParams>,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Tear down the avatar connection but keep the session alive.
    DisconnectAvatar { reply: oneshot::Sender<()> },
    /// Arm the speech recognizer.
    ConnectRecognizer {
        system_prompt: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Disarm the speech recognizer.
    DisconnectRecognizer { reply: oneshot::Sender<()> },
    /// Browser microphone audio.
    Audio(Bytes),
    /// A typed chat query from the browser.
    UserQuery {
        text: String,
        system_prompt: Option<String>,
    },
    /// Speak a raw SSML document. Replies with the synthesis result id.
    SpeakSsml {
        ssml: String,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Interrupt the avatar and clear the speak queue.
    StopSpeaking,
    /// Resume the speak queue after a reconnect.
    ContinueSpeaking,
    /// Reset the conversation history.
    ClearHistory { system_prompt: Option<String> },
    /// A recovery request that already won the arbiter's guard.
    Reconnect(ReconnectCause),
    /// Side-channel signal from the bound synthesis link. The epoch ties the
    /// signal to the bind that produced it; signals from a torn-down link are
    /// discarded.
    Link { epoch: u64, event: LinkEvent },
    /// Event from the armed recognizer.
    Recognizer(RecognizerEvent),
    /// Snapshot request from a detector or the status endpoint.
    Query(oneshot::Sender<SessionSnapshot>),
    /// Terminal stop.
    End { reply: Option<oneshot::Sender<()>> },
}

/// Point-in-time view of a session, for detectors and the status endpoint.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: AvatarState,
    pub speech_synthesizer_connected: bool,
    pub reconnecting: bool,
    pub is_speaking: bool,
    pub idle_seconds: u64,
    /// Latest media playback position report, if the link sends them.
    pub media_position_ms: Option<u64>,
    /// Seconds since the avatar last finished speaking.
    pub seconds_since_last_spoke: Option<u64>,
}

impl From<&SessionSnapshot> for StatusResponse {
    fn from(snapshot: &SessionSnapshot) -> Self {
        StatusResponse {
            speech_synthesizer_connected: snapshot.speech_synthesizer_connected,
            state: snapshot.state.as_str().to_string(),
            reconnecting: snapshot.reconnecting,
            is_speaking: snapshot.is_speaking,
            idle_seconds: snapshot.idle_seconds,
        }
    }
}
