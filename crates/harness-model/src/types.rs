// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Content block types ──────────────────────────────────────────────────────

/// A single content part in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContentPart {
    Text { text: String },
    Image { image_url: String },
}

/// Content returned by a tool – either a plain string or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ToolContentPart>),
}

impl ToolResultContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(_) => None,
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => vec![],
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ToolContentPart::Image { image_url } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl std::fmt::Display for ToolResultContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(t) => write!(f, "{t}"),
            Self::Parts(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|p| match p {
                        ToolContentPart::Text { text } => Some(text.as_str()),
                        ToolContentPart::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                write!(f, "{text}")
            }
        }
    }
}

/// A tool call requested by the model, as carried on an assistant `Message`
/// and on a `ContentBlock::ToolUse` block. `id` is assigned by the provider
/// and is the sole join key against the matching tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One block of a block-sequence message. Used for multimodal content and
/// for the streaming loop's accumulated `done` content, which preserves the
/// arrival order of text, tool_use, and tool_result blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Data URL (`data:<mime>;base64,<b64>`) or HTTPS URL.
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: ToolResultContent,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
            detail: None,
        }
    }

    pub fn image_with_detail(image_url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
            detail: Some(detail.into()),
        }
    }
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>`.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message: a plain string, or an ordered sequence of blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the conversation history.
///
/// Messages are append-only within a turn: mutation means replacing the
/// list a caller holds, never editing an entry in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Denormalised for the tokenizer and the doom-loop guard; populated on
    /// assistant messages that requested tool calls.
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Denormalised join key for tool-role messages carrying a single result.
    pub tool_result_id: Option<String>,
    /// Set on synthetic system messages injected by the summarisation strategy.
    pub is_summary: bool,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    fn bare(role: Role, content: MessageContent) -> Self {
        Self {
            id: new_id(),
            role,
            content,
            created_at: now_ms(),
            tool_calls: None,
            tool_result_id: None,
            is_summary: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::bare(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::bare(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// An assistant message carrying tool calls alongside any preamble text.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let mut m = Self::bare(Role::Assistant, MessageContent::Text(text.into()));
        m.tool_calls = Some(tool_calls);
        m
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        let mut m = Self::bare(Role::Tool, MessageContent::Text(content.into()));
        m.tool_result_id = Some(id);
        m
    }

    pub fn user_with_parts(blocks: Vec<ContentBlock>) -> Self {
        let content = if blocks.len() == 1 {
            match &blocks[0] {
                ContentBlock::Text { text } => MessageContent::Text(text.clone()),
                _ => MessageContent::Blocks(blocks),
            }
        } else if blocks.is_empty() {
            MessageContent::Text(String::new())
        } else {
            MessageContent::Blocks(blocks)
        };
        Self::bare(Role::User, content)
    }

    pub fn synthetic_system(text: impl Into<String>, id: impl Into<String>, created_at: i64) -> Self {
        let mut m = Self::bare(Role::System, MessageContent::Text(text.into()));
        m.id = id.into();
        m.created_at = created_at;
        m
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Image { image_url, .. } => Some(image_url.as_str()),
                    ContentBlock::ToolResult { content, .. } => content.image_urls().pop(),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub system_prompt: Option<String>,
    pub thinking_level: Option<String>,
    /// Cache boundary key; providers that support prompt caching use this to
    /// decide which prefix of `messages` is cacheable across turns.
    pub cache_key: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_has_unique_ids() {
        let a = Message::user("x");
        let b = Message::user("x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn assistant_with_tool_calls_carries_denormalised_list() {
        let calls = vec![ToolCallRequest {
            id: "c1".into(),
            name: "grep".into(),
            arguments: serde_json::json!({"pattern": "foo"}),
        }];
        let m = Message::assistant_with_tool_calls("", calls.clone());
        assert_eq!(m.tool_calls, Some(calls));
    }

    #[test]
    fn tool_result_sets_tool_result_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.tool_result_id.as_deref(), Some("call-1"));
        assert_eq!(m.as_text(), Some("output"));
    }

    #[test]
    fn synthetic_system_uses_fixed_id_and_timestamp() {
        let m = Message::synthetic_system("summary", "sys-synthetic", 0);
        assert_eq!(m.id, "sys-synthetic");
        assert_eq!(m.created_at, 0);
        assert_eq!(m.role, Role::System);
    }

    #[test]
    fn user_with_parts_collapses_single_text_block() {
        let m = Message::user_with_parts(vec![ContentBlock::text("hi")]);
        assert!(matches!(m.content, MessageContent::Text(_)));
    }

    #[test]
    fn user_with_parts_keeps_blocks_for_images() {
        let m = Message::user_with_parts(vec![
            ContentBlock::text("what is this?"),
            ContentBlock::image("data:image/png;base64,XYZ"),
        ]);
        assert_eq!(m.image_urls(), vec!["data:image/png;base64,XYZ"]);
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
    }

    #[test]
    fn tool_result_content_text_round_trip() {
        let c = ToolResultContent::Text("hello".into());
        let json = serde_json::to_string(&c).unwrap();
        let back: ToolResultContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_text(), Some("hello"));
    }

    #[test]
    fn content_block_image_with_detail_round_trip() {
        let b = ContentBlock::image_with_detail("data:image/png;base64,ABC", "low");
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"detail\""));
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn content_block_image_without_detail_omits_field() {
        let b = ContentBlock::image("data:image/png;base64,ABC");
        let json = serde_json::to_string(&b).unwrap();
        assert!(!json.contains("\"detail\""));
    }

    #[test]
    fn parse_data_url_parts_splits_mime_and_payload() {
        let (mime, b64) = parse_data_url_parts("data:image/png;base64,ABC123").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(b64, "ABC123");
    }

    #[test]
    fn parse_data_url_parts_rejects_non_data_url() {
        assert!(parse_data_url_parts("https://example.com/x.png").is_err());
    }
}
