// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent loop and the supporting machinery around it: token budgeting,
//! truncation strategies, the doom-loop guard, the versioned event bus,
//! retry/backoff for transient provider errors, and the sub-agent pool.
//! `harness-model` and `harness-tools` define the wire shapes this crate
//! drives; concrete providers, tools, and permission policy are supplied by
//! the embedder.
mod agent;
mod context;
mod events;
mod guard;
mod pool;
mod retry;
mod strategies;
mod tokenizer;

pub use agent::{
    AgentLoop, AgentLoopConfig, AgentLoopResult, DelegationClassifier, NeverDelegate, StepResult,
};
pub use context::{ConfigurationError, ContextManager, PrepareOptions, UsageReport, SYNTHETIC_SYSTEM_MESSAGE_ID};
pub use events::{EventBus, EventKind, EventType, HarnessEvent, TerminationReason, ToolEventBridge, Unsubscribe};
pub use guard::{call_signature, DoomLoopGuard};
pub use pool::{
    AgentLoopFactory, ChildAgentContext, ChildResult, ChildState, ChildStatus, ChildSuccess, EchoFactory,
    SubAgentPool,
};
pub use retry::{
    calculate_backoff, classify_error, parse_retry_after, retry, ClassifiableError, Classification,
    RetryExhaustedError, RetryOptions,
};
pub use strategies::{
    DropOldest, KeepSystemAndRecent, Summarise, SlidingWindow, StrategyOptions, TruncationStrategy,
};
pub use tokenizer::{estimate_conversation, estimate_message, estimate_text};
