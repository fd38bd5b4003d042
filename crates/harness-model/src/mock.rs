// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::provider::{ChatResponse, FinishReason, InputModality, ResponseStream, StreamUsage};
use crate::{CompletionRequest, Provider, Role, StreamEvent, ToolCallRequest};

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::Token(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Done {
                finish_reason: FinishReason::Stop,
                usage: Some(StreamUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Default::default()
                }),
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }

    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<ChatResponse> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        Ok(ChatResponse {
            content: format!("MOCK: {reply}"),
            model: self.model_name().to_string(),
            usage: StreamUsage {
                input_tokens: 10,
                output_tokens: 10,
                ..Default::default()
            },
            finish_reason: FinishReason::Stop,
        })
    }
}

/// A pre-scripted mock provider. Each call to `stream` pops the next
/// response script from the front of the queue. This lets tests specify
/// exact event sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    name: String,
    /// Claimed input modalities. Defaults to `[Text]` (conservative).
    modalities: Vec<InputModality>,
    /// The last `CompletionRequest` seen by this provider.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            modalities: vec![InputModality::Text],
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare that this mock supports image input as well as text.
    pub fn with_vision(mut self) -> Self {
        self.modalities = vec![InputModality::Text, InputModality::Image];
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            StreamEvent::Token(reply.into()),
            StreamEvent::Done {
                finish_reason: FinishReason::Stop,
                usage: Some(StreamUsage {
                    input_tokens: 5,
                    output_tokens: 5,
                    ..Default::default()
                }),
            },
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCallStart(ToolCallRequest {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments,
                }),
                StreamEvent::Done {
                    finish_reason: FinishReason::ToolUse,
                    usage: None,
                },
            ],
            vec![
                StreamEvent::Token(final_text.into()),
                StreamEvent::Done {
                    finish_reason: FinishReason::Stop,
                    usage: None,
                },
            ],
        ])
    }
}

#[async_trait]
impl Provider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.modalities.clone()
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    StreamEvent::Token("[no more scripts]".into()),
                    StreamEvent::Done {
                        finish_reason: FinishReason::Stop,
                        usage: None,
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }

    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<ChatResponse> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![StreamEvent::Token("[no more scripts]".into())]
            } else {
                scripts.remove(0)
            }
        };
        let content = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Ok(ChatResponse {
            content,
            model: self.model_name().to_string(),
            usage: StreamUsage::default(),
            finish_reason: FinishReason::Stop,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
