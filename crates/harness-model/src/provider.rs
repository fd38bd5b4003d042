// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ToolCallRequest};

/// Input modality a model can accept alongside text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputModality {
    Text,
    Image,
}

/// Why a streamed completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced a final answer with no further tool calls.
    Stop,
    /// One or more tool calls were requested; the loop should execute them
    /// and feed the results back in for another round.
    ToolUse,
    /// The model's output token budget was exhausted mid-turn.
    MaxTokens,
    /// The provider reported an error after streaming had begun.
    Error,
}

/// Token accounting for a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

/// One event in a provider's streamed response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental visible text.
    Token(String),
    /// Incremental reasoning/thinking text, kept separate from visible output.
    Thinking(String),
    /// A fully-assembled tool call request. Providers accumulate the
    /// argument JSON internally and emit this once parsing completes.
    ToolCallStart(ToolCallRequest),
    /// A provider-level error occurred; the stream ends after this event.
    Error(String),
    /// Terminal event. `usage` is `None` only when the provider's wire
    /// format never reports it (rare; callers should treat this as unknown
    /// rather than zero).
    Done {
        finish_reason: FinishReason,
        usage: Option<StreamUsage>,
    },
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// A single non-streamed completion, used by the summarisation strategy.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: StreamUsage,
    pub finish_reason: FinishReason,
}

/// The narrow capability the agent loop consumes. Concrete provider
/// implementations (wire formats, authentication, retries against a
/// specific vendor API) are an external collaborator and out of scope here.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name for status display and logging.
    fn name(&self) -> &str;

    /// Model identifier as reported to callers.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, request: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Send a completion request and return a single accumulated response.
    /// Used by the context manager's summarisation strategy, which needs a
    /// plain string back rather than an event stream.
    async fn chat(&self, request: CompletionRequest) -> anyhow::Result<ChatResponse>;

    /// Context window size in tokens, when known.
    fn context_window(&self) -> Option<u32> {
        None
    }

    /// Input modalities this provider/model combination accepts.
    fn input_modalities(&self) -> Vec<InputModality> {
        vec![InputModality::Text]
    }

    fn supports_images(&self) -> bool {
        self.input_modalities().contains(&InputModality::Image)
    }
}
