// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The four context-truncation strategies, selected by the embedder and
//! driven by the context manager once a conversation exceeds its budget.
use std::sync::Arc;

use async_trait::async_trait;
use harness_model::{Message, MessageContent, Provider, Role};
use uuid::Uuid;

use crate::tokenizer;

/// Resolved budget handed to a strategy by the context manager. A strategy
/// computes its own effective limit from these the same way the manager
/// computes its own.
#[derive(Debug, Clone, Copy)]
pub struct StrategyOptions {
    pub max_tokens: usize,
    pub reserved_tokens: usize,
    pub keep_recent_messages: Option<usize>,
}

impl StrategyOptions {
    pub fn effective_limit(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_tokens).max(1)
    }
}

#[async_trait]
pub trait TruncationStrategy: Send + Sync {
    async fn apply(&self, messages: Vec<Message>, options: &StrategyOptions) -> Vec<Message>;
}

fn is_always_keep(message: &Message) -> bool {
    message.role == Role::System || message.is_summary
}

/// Shrink a text message's content from the tail until it fits the given
/// per-message token budget. Block-sequence content is returned unchanged
/// and must be preserved intact.
pub fn truncate_message_to_fit(message: &Message, max_message_tokens: usize) -> Message {
    const BASE_OVERHEAD: usize = 5;
    let mut result = message.clone();
    let MessageContent::Text(text) = &result.content else {
        return result;
    };
    let tool_calls_tokens = match &result.tool_calls {
        None => 0,
        Some(calls) => serde_json::to_string(calls)
            .map(|j| tokenizer::estimate_text(&j))
            .unwrap_or(0),
    };
    let tool_result_tokens = result
        .tool_result_id
        .as_deref()
        .map(tokenizer::estimate_text)
        .unwrap_or(0);
    let overhead = BASE_OVERHEAD + tool_calls_tokens + tool_result_tokens;
    let budget = max_message_tokens.saturating_sub(overhead).max(1);
    let truncated = truncate_text_to_budget(text, budget);
    result.content = MessageContent::Text(truncated);
    result
}

/// Shrink `text` from the tail while its estimated token count exceeds
/// `budget`, starting from a 4x over-estimate for a fast first cut.
pub fn truncate_text_to_budget(text: &str, budget: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut len = chars.len().min(budget.saturating_mul(4));
    let mut candidate: String = chars[..len].iter().collect();
    while tokenizer::estimate_text(&candidate) > budget && len > 0 {
        len -= 1;
        candidate = chars[..len].iter().collect();
    }
    candidate
}

fn conversation_tokens(messages: &[Message]) -> usize {
    tokenizer::estimate_conversation(messages)
}

/// Repeatedly remove the earliest non-system, non-summary message until
/// under budget; if still over, truncate all remaining messages' content.
pub struct DropOldest;

#[async_trait]
impl TruncationStrategy for DropOldest {
    async fn apply(&self, messages: Vec<Message>, options: &StrategyOptions) -> Vec<Message> {
        let limit = options.effective_limit();
        let mut current = messages;
        while conversation_tokens(&current) > limit {
            match current.iter().position(|m| !is_always_keep(m)) {
                Some(idx) => {
                    current.remove(idx);
                }
                None => break,
            }
        }
        if conversation_tokens(&current) > limit && !current.is_empty() {
            let per_message_budget = (limit / current.len()).max(1);
            current = current
                .into_iter()
                .map(|m| truncate_message_to_fit(&m, per_message_budget))
                .collect();
        }
        current
    }
}

/// Starting from the newest non-system message and walking backward,
/// greedily keep a contiguous run of messages that fits the budget.
pub struct SlidingWindow;

impl SlidingWindow {
    fn fallback(keep: &[Message], latest: Option<&Message>, limit: usize) -> Vec<Message> {
        let mut result = keep.to_vec();
        if let Some(latest) = latest {
            let keep_tokens: usize = keep.iter().map(tokenizer::estimate_message).sum();
            let budget = limit.saturating_sub(keep_tokens).max(1);
            result.push(truncate_message_to_fit(latest, budget));
        }
        result
    }
}

#[async_trait]
impl TruncationStrategy for SlidingWindow {
    async fn apply(&self, messages: Vec<Message>, options: &StrategyOptions) -> Vec<Message> {
        let limit = options.effective_limit();
        let keep: Vec<Message> = messages.iter().filter(|m| is_always_keep(m)).cloned().collect();
        let keep_tokens: usize = keep.iter().map(tokenizer::estimate_message).sum();
        let droppable: Vec<&Message> = messages.iter().filter(|m| !is_always_keep(m)).collect();

        let mut selected_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut running_total = keep_tokens + 3;
        for m in droppable.iter().rev() {
            let mt = tokenizer::estimate_message(m);
            if running_total + mt <= limit {
                selected_ids.insert(m.id.as_str());
                running_total += mt;
            } else {
                break;
            }
        }

        if selected_ids.is_empty() && !droppable.is_empty() {
            return Self::fallback(&keep, droppable.last().copied(), limit);
        }

        messages
            .into_iter()
            .filter(|m| is_always_keep(m) || selected_ids.contains(m.id.as_str()))
            .collect()
    }
}

/// Groups non-system messages into user-led turns (a user message plus
/// everything that follows it up to the next user message); unpaired
/// leading messages form singleton groups. Keeps whole groups, newest first.
pub struct KeepSystemAndRecent;

fn group_into_turns(messages: &[&Message]) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    for m in messages {
        if m.role == Role::User {
            groups.push(vec![(*m).clone()]);
        } else if let Some(last) = groups.last_mut() {
            last.push((*m).clone());
        } else {
            groups.push(vec![(*m).clone()]);
        }
    }
    groups
}

#[async_trait]
impl TruncationStrategy for KeepSystemAndRecent {
    async fn apply(&self, messages: Vec<Message>, options: &StrategyOptions) -> Vec<Message> {
        let limit = options.effective_limit();
        let keep: Vec<Message> = messages.iter().filter(|m| is_always_keep(m)).cloned().collect();
        let keep_tokens: usize = keep.iter().map(tokenizer::estimate_message).sum();
        let droppable: Vec<&Message> = messages.iter().filter(|m| !is_always_keep(m)).collect();
        let groups = group_into_turns(&droppable);

        let mut selected_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut running_total = keep_tokens + 3;
        for group in groups.iter().rev() {
            let group_tokens: usize = group.iter().map(tokenizer::estimate_message).sum();
            if running_total + group_tokens <= limit {
                for m in group {
                    selected_ids.insert(m.id.clone());
                }
                running_total += group_tokens;
            } else {
                break;
            }
        }

        if selected_ids.is_empty() && !droppable.is_empty() {
            return SlidingWindow::fallback(&keep, droppable.last().copied(), limit);
        }

        messages
            .into_iter()
            .filter(|m| is_always_keep(m) || selected_ids.contains(&m.id))
            .collect()
    }
}

/// Summarises the oldest slice of the conversation via the provider's
/// non-streaming `chat` call, keeping the most recent `keepRecentMessages`
/// messages verbatim. Falls back to [`DropOldest`] if the provider call
/// fails.
pub struct Summarise {
    provider: Arc<dyn Provider>,
    default_keep_recent: usize,
    summary_max_tokens: usize,
}

impl Summarise {
    pub fn new(provider: Arc<dyn Provider>, default_keep_recent: usize, summary_max_tokens: usize) -> Self {
        Self {
            provider,
            default_keep_recent,
            summary_max_tokens,
        }
    }

    fn render_for_summary(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| {
                let role = tokenizer::role_label(&m.role);
                let text = m.as_text().unwrap_or("");
                format!("{role}: {text}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl TruncationStrategy for Summarise {
    async fn apply(&self, messages: Vec<Message>, options: &StrategyOptions) -> Vec<Message> {
        let system_count = messages.iter().filter(|m| m.role == Role::System).count();
        let keep_recent = options.keep_recent_messages.unwrap_or(self.default_keep_recent);

        if messages.len() <= keep_recent + system_count {
            return messages;
        }

        let plain_system: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System && !m.is_summary)
            .cloned()
            .collect();
        let existing_summaries: Vec<Message> = messages.iter().filter(|m| m.is_summary).cloned().collect();
        let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();

        let split_at = non_system.len().saturating_sub(keep_recent);
        let oldest = &non_system[..split_at];
        let recent = &non_system[split_at..];

        let excerpt = Self::render_for_summary(oldest);
        let bounded_excerpt = truncate_text_to_budget(&excerpt, self.summary_max_tokens);

        let request = harness_model::CompletionRequest {
            messages: vec![Message::user(bounded_excerpt)],
            system_prompt: Some(
                "Summarise the following conversation excerpt concisely, preserving \
                 decisions and facts needed for continuity."
                    .to_string(),
            ),
            ..Default::default()
        };

        match self.provider.chat(request).await {
            Ok(response) => {
                let summary = Message::synthetic_system(
                    response.content,
                    format!("summary-{}", Uuid::new_v4()),
                    0,
                );
                let mut result = plain_system;
                result.extend(existing_summaries);
                result.push(summary);
                result.extend(recent.iter().cloned());
                result
            }
            Err(err) => {
                tracing::warn!(error = %err, "summarisation provider call failed; falling back to drop-oldest");
                DropOldest.apply(messages, options).await
            }
        }
    }
}
