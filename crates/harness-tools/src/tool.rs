// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by the model.
///
/// `id` is assigned by the provider and is the sole join key against the
/// matching [`ToolPipelineResult`]; it only needs to be unique within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Free-form key→value arguments.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool invocation as it exits the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Error,
    Truncated,
}

/// `{callId, name, status, output, durationMs, truncated?, originalLength?}`
/// from the data model. Every emitted [`ToolCall`] receives exactly one of
/// these — a synthetic error result on permission denial or pipeline
/// misconfiguration counts as "one".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPipelineResult {
    pub call_id: String,
    pub name: String,
    pub status: PipelineStatus,
    pub output: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_length: Option<usize>,
}

impl ToolPipelineResult {
    /// Build a synthetic error result outside of a live pipeline call —
    /// permission denial, an unconfigured pipeline, an aborted call, a
    /// failed before-hook, a malformed delegation response.
    pub fn synthetic_error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: PipelineStatus::Error,
            output: message.into(),
            duration_ms: 0,
            truncated: None,
            original_length: None,
        }
    }
}
