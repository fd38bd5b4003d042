// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool invocation pipeline: a narrow seam between an agent loop and
//! whatever concrete tools an embedder registers. This crate defines the
//! call/result shapes and the fixed before/execute/after pipeline around
//! them; it does not implement, register, or sandbox any concrete tool.
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod tool;

pub use events::{EventSink, NullSink, PipelineEvent};
pub use executor::{AllowAll, PermissionChecker, RawToolOutput, ToolContext, ToolExecutor};
pub use pipeline::{AfterHook, BeforeHook, PipelineConfig, ToolPipeline};
pub use tool::{PipelineStatus, ToolCall, ToolPipelineResult};
