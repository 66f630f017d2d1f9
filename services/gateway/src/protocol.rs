//! Defines the websocket message protocol between the browser client and the
//! gateway. Every message carries a `path` discriminator, mirroring the REST
//! route it corresponds to; the push channel preserves per-session order.

use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the gateway.
#[derive(Deserialize, Debug)]
#[serde(tag = "path")]
pub enum ClientWsMessage {
    /// A chunk of microphone audio, base64-encoded PCM16.
    #[serde(rename = "api.audio")]
    Audio {
        #[serde(rename = "audioChunk")]
        audio_chunk: String,
    },
    /// A typed chat query.
    #[serde(rename = "api.chat")]
    Chat {
        #[serde(rename = "userQuery")]
        user_query: String,
        #[serde(rename = "systemPrompt")]
        system_prompt: Option<String>,
    },
    /// Interrupt the avatar mid-utterance.
    #[serde(rename = "api.stopSpeaking")]
    StopSpeaking,
}

/// Messages pushed from the gateway to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "path")]
pub enum PushMessage {
    /// A fragment of chat display text (append semantics).
    #[serde(rename = "api.chat")]
    Chat {
        #[serde(rename = "chatResponse")]
        chat_response: String,
    },
    /// The complete text of a finished chat turn, for one rich re-render.
    #[serde(rename = "api.chat.complete")]
    ChatTurnComplete {
        #[serde(rename = "fullText")]
        full_text: String,
    },
    /// A lifecycle event notification.
    #[serde(rename = "api.event")]
    Event {
        #[serde(rename = "eventType")]
        event_type: SessionEventType,
    },
    /// A latency measurement extracted from the stream or taken locally.
    #[serde(rename = "api.latency")]
    Latency {
        #[serde(rename = "latencyKind")]
        kind: LatencyKind,
        #[serde(rename = "milliseconds")]
        milliseconds: u64,
    },
    /// A diagram the client should render.
    #[serde(rename = "api.diagram")]
    Diagram {
        #[serde(rename = "diagramPath")]
        diagram_path: String,
    },
    /// The structural JSON accompanying a diagram.
    #[serde(rename = "api.structure")]
    Structure {
        #[serde(rename = "structureJson")]
        structure_json: String,
    },
    /// A human-readable status line (connect failures, aborted turns).
    #[serde(rename = "api.status")]
    Status { message: String },
    /// The remote SDP of a freshly re-bound media connection. Sent when the
    /// gateway reconnects the avatar on its own, so the browser can renew its
    /// peer connection without another REST round trip.
    #[serde(rename = "api.avatar")]
    AvatarSdp {
        #[serde(rename = "remoteSdp")]
        remote_sdp: String,
    },
}

/// Lifecycle notifications pushed on the event path.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventType {
    SpeechSynthesizerConnected,
    SpeechSynthesizerDisconnected,
    Reconnecting,
    ReconnectSuppressed,
    SessionEnded,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LatencyKind {
    SttLatency,
    FirstTokenLatency,
    FirstSentenceLatency,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_messages_use_path_discriminators() {
        let msg = PushMessage::Chat {
            chat_response: "hello".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"path":"api.chat","chatResponse":"hello"}"#);

        let msg = PushMessage::Event {
            event_type: SessionEventType::SpeechSynthesizerDisconnected,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"path":"api.event","eventType":"SPEECH_SYNTHESIZER_DISCONNECTED"}"#
        );
    }

    #[test]
    fn client_messages_parse_by_path() {
        let parsed: ClientWsMessage =
            serde_json::from_str(r#"{"path":"api.audio","audioChunk":"AAEC"}"#).unwrap();
        assert!(matches!(parsed, ClientWsMessage::Audio { .. }));

        let parsed: ClientWsMessage = serde_json::from_str(
            r#"{"path":"api.chat","userQuery":"hi","systemPrompt":"be brief"}"#,
        )
        .unwrap();
        match parsed {
            ClientWsMessage::Chat {
                user_query,
                system_prompt,
            } => {
                assert_eq!(user_query, "hi");
                assert_eq!(system_prompt.as_deref(), Some("be brief"));
            }
            _ => panic!("expected chat message"),
        }

        let parsed: ClientWsMessage =
            serde_json::from_str(r#"{"path":"api.stopSpeaking"}"#).unwrap();
        assert!(matches!(parsed, ClientWsMessage::StopSpeaking));
    }

    #[test]
    fn unknown_path_is_rejected() {
        let result: Result<ClientWsMessage, _> =
            serde_json::from_str(r#"{"path":"api.unknown"}"#);
        assert!(result.is_err());
    }
}
