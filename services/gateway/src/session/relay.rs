//! Streaming chat relay.
//!
//! One task per chat turn: it opens the token stream, feeds every chunk
//! through the reassembly buffer, forwards display text to the client
//! incrementally (append semantics) and hands completed sentences to the
//! speak queue. When the stream goes quiet for the configured period the turn
//! is complete: the buffer is flushed and a single turn-complete message
//! carries the accumulated text for the client's one rich re-render —
//! re-parsing rich markup on every token would be wasteful and visually
//! unstable, so incremental updates stay plain.

use crate::protocol::{LatencyKind, PushMessage};
use crate::session::speaker::Speaker;
use futures::StreamExt;
use parley_core::chat::{ChatClient, ChatMessage};
use parley_core::markers::StreamMarker;
use parley_core::reassembly::ReassemblyBuffer;
use parley_core::sentence::SentenceSplitter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Everything a chat turn needs, cloned out of the session.
#[derive(Clone)]
pub struct ChatTurnContext {
    pub chat: Arc<dyn ChatClient>,
    pub outbound: mpsc::Sender<PushMessage>,
    pub speaker: Speaker,
    pub history: Arc<Mutex<Vec<ChatMessage>>>,
    pub system_prompt: String,
    pub quiet_period: Duration,
}

/// Spawns the relay task for one turn. The caller keeps the handle and aborts
/// it if the user interrupts with a new query.
pub fn spawn_chat_turn(ctx: ChatTurnContext, user_query: String) -> JoinHandle<()> {
    tokio::spawn(async move { run_chat_turn(ctx, user_query).await })
}

async fn run_chat_turn(ctx: ChatTurnContext, user_query: String) {
    let history_snapshot = {
        let mut history = ctx.history.lock().await;
        history.push(ChatMessage::user(user_query.clone()));
        history.clone()
    };

    let turn_start = Instant::now();
    let mut stream = match ctx
        .chat
        .stream_chat(&ctx.system_prompt, &history_snapshot, &user_query)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = ?e, "Chat turn could not be opened.");
            push(
                &ctx,
                PushMessage::Status {
                    message: "The assistant is unavailable right now.".into(),
                },
            )
            .await;
            return;
        }
    };

    let mut buffer = ReassemblyBuffer::new();
    let mut splitter = SentenceSplitter::new();
    let mut full_text = String::new();
    let mut first_chunk = true;
    let mut first_sentence = true;

    loop {
        let next = tokio::time::timeout(ctx.quiet_period, stream.next()).await;
        let chunk = match next {
            // Quiet period elapsed: the response is complete.
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(error = ?e, "Chat stream failed mid-turn.");
                push(
                    &ctx,
                    PushMessage::Status {
                        message: "The response was interrupted.".into(),
                    },
                )
                .await;
                break;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        if first_chunk {
            first_chunk = false;
            let ms = turn_start.elapsed().as_millis() as u64;
            info!(latency_ms = ms, "First chat token received.");
            push(
                &ctx,
                PushMessage::Latency {
                    kind: LatencyKind::FirstTokenLatency,
                    milliseconds: ms,
                },
            )
            .await;
        }

        let mut markers = Vec::new();
        let display = buffer.feed(&chunk, |m| markers.push(m));
        for marker in markers {
            handle_marker(&ctx, marker).await;
        }

        if !display.is_empty() {
            if full_text.is_empty() {
                push(
                    &ctx,
                    PushMessage::Chat {
                        chat_response: "Assistant: ".into(),
                    },
                )
                .await;
            }
            push(
                &ctx,
                PushMessage::Chat {
                    chat_response: display.clone(),
                },
            )
            .await;
            full_text.push_str(&display);

            for sentence in splitter.push(&display) {
                if first_sentence {
                    first_sentence = false;
                    let ms = turn_start.elapsed().as_millis() as u64;
                    info!(latency_ms = ms, "First chat sentence completed.");
                    push(
                        &ctx,
                        PushMessage::Latency {
                            kind: LatencyKind::FirstSentenceLatency,
                            milliseconds: ms,
                        },
                    )
                    .await;
                }
                ctx.speaker.enqueue(sentence, 0);
            }
        }
    }

    // Anything withheld at stream end is plain content after all.
    let rest = buffer.flush();
    if !rest.is_empty() {
        if full_text.is_empty() {
            push(
                &ctx,
                PushMessage::Chat {
                    chat_response: "Assistant: ".into(),
                },
            )
            .await;
        }
        push(
            &ctx,
            PushMessage::Chat {
                chat_response: rest.clone(),
            },
        )
        .await;
        full_text.push_str(&rest);
        for sentence in splitter.push(&rest) {
            ctx.speaker.enqueue(sentence, 0);
        }
    }
    if let Some(tail) = splitter.finish() {
        ctx.speaker.enqueue(tail, 0);
    }

    push(
        &ctx,
        PushMessage::ChatTurnComplete {
            full_text: full_text.clone(),
        },
    )
    .await;

    if !full_text.is_empty() {
        ctx.history.lock().await.push(ChatMessage::assistant(full_text));
    }
}

/// Acts on one extracted marker: latency values are logged and forwarded,
/// diagram references are pushed for rendering. Each fires exactly once.
async fn handle_marker(ctx: &ChatTurnContext, marker: StreamMarker) {
    let msg = match marker {
        StreamMarker::SttLatency(ms) => {
            info!(latency_ms = ms, "Upstream speech-to-text latency.");
            PushMessage::Latency {
                kind: LatencyKind::SttLatency,
                milliseconds: ms,
            }
        }
        StreamMarker::FirstTokenLatency(ms) => {
            info!(latency_ms = ms, "Upstream first-token latency.");
            PushMessage::Latency {
                kind: LatencyKind::FirstTokenLatency,
                milliseconds: ms,
            }
        }
        StreamMarker::FirstSentenceLatency(ms) => {
            info!(latency_ms = ms, "Upstream first-sentence latency.");
            PushMessage::Latency {
                kind: LatencyKind::FirstSentenceLatency,
                milliseconds: ms,
            }
        }
        StreamMarker::Diagram(path) => {
            info!(%path, "Diagram reference received.");
            PushMessage::Diagram { diagram_path: path }
        }
        StreamMarker::Structure(json) => PushMessage::Structure {
            structure_json: json,
        },
    };
    push(ctx, msg).await;
}

async fn push(ctx: &ChatTurnContext, msg: PushMessage) {
    if ctx.outbound.send(msg).await.is_err() {
        // The session is shutting down; the turn task will be aborted soon.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::chat::ScriptedChatClient;

    fn context(
        chat: Arc<ScriptedChatClient>,
        quiet_ms: u64,
    ) -> (ChatTurnContext, mpsc::Receiver<PushMessage>) {
        let (outbound, rx) = mpsc::channel(256);
        let ctx = ChatTurnContext {
            chat,
            outbound,
            speaker: Speaker::new("en-US-Jenny".into()),
            history: Arc::new(Mutex::new(Vec::new())),
            system_prompt: "You are a helpful assistant.".into(),
            quiet_period: Duration::from_millis(quiet_ms),
        };
        (ctx, rx)
    }

    async fn drain(mut rx: mpsc::Receiver<PushMessage>) -> Vec<PushMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            messages.push(msg);
        }
        messages
    }

    fn display_text(messages: &[PushMessage]) -> String {
        messages
            .iter()
            .filter_map(|m| match m {
                PushMessage::Chat { chat_response } => Some(chat_response.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn split_tag_yields_clean_text_and_one_render() {
        let chat = Arc::new(ScriptedChatClient::new());
        chat.push_turn(["Hello <DIA", "GRAM>img1</DIAGRAM> world"]);
        let (ctx, rx) = context(chat, 100);

        run_chat_turn(ctx, "draw something".into()).await;
        let messages = drain(rx).await;

        assert_eq!(display_text(&messages), "Assistant: Hello  world");

        let diagrams: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, PushMessage::Diagram { .. }))
            .collect();
        assert_eq!(diagrams.len(), 1);
        assert!(matches!(
            diagrams[0],
            PushMessage::Diagram { diagram_path } if diagram_path == "img1"
        ));

        let complete: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                PushMessage::ChatTurnComplete { full_text } => Some(full_text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(complete, vec!["Hello  world".to_string()]);
    }

    #[tokio::test]
    async fn malformed_marker_passes_through_without_latency_entry() {
        let chat = Arc::new(ScriptedChatClient::new());
        chat.push_turn(["before <FTL>abc</FTL> after"]);
        let (ctx, rx) = context(chat, 100);

        run_chat_turn(ctx, "hi".into()).await;
        let messages = drain(rx).await;

        assert_eq!(
            display_text(&messages),
            "Assistant: before <FTL>abc</FTL> after"
        );
        // The relay records its own first-token latency, but the malformed
        // in-band marker must not add a second entry.
        let latencies = messages
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    PushMessage::Latency {
                        kind: LatencyKind::FirstTokenLatency,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(latencies, 1);
    }

    #[tokio::test]
    async fn turn_records_history_without_markers() {
        let chat = Arc::new(ScriptedChatClient::new());
        chat.push_turn(["The answer<FSL>12</FSL> is 42."]);
        let (ctx, rx) = context(chat, 100);
        let history = ctx.history.clone();

        run_chat_turn(ctx, "what is the answer?".into()).await;
        drain(rx).await;

        let history = history.lock().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "what is the answer?");
        assert_eq!(history[1].content, "The answer is 42.");
    }

    #[tokio::test]
    async fn failed_open_pushes_status_and_records_nothing_spoken() {
        let chat = Arc::new(ScriptedChatClient::new());
        // No scripted turn queued: opening the stream fails.
        let (ctx, rx) = context(chat, 100);
        let history = ctx.history.clone();

        run_chat_turn(ctx, "hello?".into()).await;
        let messages = drain(rx).await;

        assert!(messages
            .iter()
            .any(|m| matches!(m, PushMessage::Status { .. })));
        assert!(!messages
            .iter()
            .any(|m| matches!(m, PushMessage::ChatTurnComplete { .. })));
        // The user message stays recorded; no assistant reply is added.
        assert_eq!(history.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn withheld_text_is_released_at_turn_end() {
        let chat = Arc::new(ScriptedChatClient::new());
        chat.push_turn(["price is 1 <"]);
        let (ctx, rx) = context(chat, 50);

        run_chat_turn(ctx, "price?".into()).await;
        let messages = drain(rx).await;

        assert_eq!(display_text(&messages), "Assistant: price is 1 <");
    }
}
