// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A deterministic, pure token-count estimator. Not a real tokenizer for any
//! particular model — a stable heuristic the context manager and doom-loop
//! guard can both budget against without depending on a vendor's BPE tables.
use harness_model::{Message, MessageContent, Role, ToolCallRequest};

const FRAMING_OVERHEAD: usize = 4;
const ROLE_COST: usize = 1;
const CONVERSATION_OVERHEAD: usize = 3;

/// Estimate the token count of a single string.
///
/// `max(1, segmentCount, ceil(chars/4))`, where segments are runs of
/// non-whitespace/non-punctuation characters. An empty (or all-whitespace)
/// string always returns 1.
pub fn estimate_text(text: &str) -> usize {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 1;
    }
    let segment_count = trimmed
        .split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '_'))
        .filter(|s| !s.is_empty())
        .count();
    let char_estimate = (trimmed.chars().count() + 3) / 4;
    segment_count.max(char_estimate).max(1)
}

fn estimate_tool_calls(calls: &Option<Vec<ToolCallRequest>>) -> usize {
    match calls {
        None => 0,
        Some(calls) => match serde_json::to_string(calls) {
            Ok(json) => estimate_text(&json),
            Err(_) => 0,
        },
    }
}

fn estimate_content(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(text) => estimate_text(text),
        MessageContent::Blocks(blocks) => {
            let json = serde_json::to_string(blocks).unwrap_or_default();
            estimate_text(&json)
        }
    }
}

/// `framingOverhead(4) + roleCost(1) + tokens(content) + tokens(JSON(toolCalls)?) + tokens(toolResultId?)`.
pub fn estimate_message(message: &Message) -> usize {
    let mut total = FRAMING_OVERHEAD + ROLE_COST + estimate_content(&message.content);
    total += estimate_tool_calls(&message.tool_calls);
    if let Some(id) = &message.tool_result_id {
        total += estimate_text(id);
    }
    total
}

pub fn role_label(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// `conversationOverhead(3) + Σ messageTokens`.
pub fn estimate_conversation(messages: &[Message]) -> usize {
    CONVERSATION_OVERHEAD + messages.iter().map(estimate_message).sum::<usize>()
}
