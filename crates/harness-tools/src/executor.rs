// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use harness_model::CancelToken;

use crate::tool::ToolCall;

/// Per-call context handed to the executor and to hooks. Carries the
/// cancellation signal so a long-running tool can observe abort.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel: CancelToken,
}

impl ToolContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

/// What a [`ToolExecutor`] hands back on success, before pipeline
/// normalisation. A plain string is used as-is for the result's `output`
/// field; any other JSON value is serialised for both measurement and
/// display ("non-string outputs are JSON-serialised for measurement").
#[derive(Debug, Clone)]
pub enum RawToolOutput {
    Text(String),
    Value(serde_json::Value),
}

impl RawToolOutput {
    /// The string the pipeline measures and (absent truncation) emits.
    pub fn into_output_string(self) -> String {
        match self {
            RawToolOutput::Text(s) => s,
            RawToolOutput::Value(v) => serde_json::to_string(&v).unwrap_or_default(),
        }
    }
}

/// The narrow capability the tool pipeline delegates to. Concrete tool
/// implementations (shell, filesystem, search, ...) are an external
/// collaborator — plugin loading is explicitly out of scope for this crate.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run one tool call. `Err` carries a plain error message and becomes a
    /// pipeline `error` result with no truncation applied; `Ok` is
    /// normalised (and possibly truncated) by the pipeline.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<RawToolOutput, String>;
}

/// Permission policy check, supplied by the caller. The core does not define
/// permission or authentication policy — it only calls this.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn request_permission(&self, call: &ToolCall) -> bool;
}

/// A [`PermissionChecker`] that allows every call. Useful as a default for
/// embedders that enforce permissions elsewhere, and in tests.
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn request_permission(&self, _call: &ToolCall) -> bool {
        true
    }
}
