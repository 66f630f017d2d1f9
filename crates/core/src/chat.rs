//! Chat token source boundary.
//!
//! The LLM is an opaque service that turns a system prompt, the running
//! conversation and a new user query into a finite, non-restartable stream of
//! text chunks. Those chunks may carry in-band markers split at any byte
//! boundary; interpreting them is the relay's job, not the client's.

use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

/// One entry of a session's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A finite stream of raw text chunks from the LLM.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A generic client for the token-producing chat service.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streaming completion for one chat turn. The stream is finite
    /// and cannot be restarted; a failed turn must be retried from scratch by
    /// the caller.
    async fn stream_chat(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_query: &str,
    ) -> Result<ChatStream>;
}

/// An implementation of `ChatClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleChatClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleChatClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL for the service.
    /// * `model` - The chat model identifier (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAICompatibleChatClient {
    async fn stream_chat(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_query: &str,
    ) -> Result<ChatStream> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into(),
        ];
        for msg in history {
            match msg.role {
                ChatRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(msg.content.clone())
                        .build()?
                        .into(),
                ),
                ChatRole::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(msg.content.clone())
                        .build()?
                        .into(),
                ),
            }
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_query)
                .build()?
                .into(),
        );

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .context("Failed to open chat completion stream")?;

        Ok(Box::pin(stream.filter_map(|result| async {
            match result {
                Ok(response) => {
                    let choice = response.choices.first()?;
                    let content = choice.delta.content.as_ref()?;
                    if content.is_empty() {
                        None
                    } else {
                        Some(Ok(content.clone()))
                    }
                }
                Err(e) => Some(Err(anyhow::Error::from(e))),
            }
        })))
    }
}

/// A `ChatClient` that replays scripted chunk sequences, for development and
/// integration testing without external dependencies or API costs.
#[derive(Default)]
pub struct ScriptedChatClient {
    turns: Mutex<VecDeque<Vec<String>>>,
}

impl ScriptedChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the chunk sequence the next turn will stream back.
    pub fn push_turn<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks.into_iter().map(Into::into).collect();
        self.turns
            .lock()
            .expect("scripted turn queue poisoned")
            .push_back(chunks);
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream_chat(
        &self,
        _system_prompt: &str,
        _history: &[ChatMessage],
        _user_query: &str,
    ) -> Result<ChatStream> {
        let chunks: Vec<Result<String>> = self
            .turns
            .lock()
            .expect("scripted turn queue poisoned")
            .pop_front()
            .context("No scripted chat turn queued")?
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}
