// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: model call, call classification, tool dispatch, repeat —
//! until the model answers in text, the step budget is exhausted, the
//! doom-loop guard escalates, the caller cancels, or the provider errors.
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use harness_config::DoomLoopConfig;
use harness_model::{
    CancelToken, CompletionRequest, FinishReason, Message, Provider, StreamEvent, ToolCallRequest,
    ToolSchema,
};
use harness_tools::{PermissionChecker, PipelineStatus, ToolContext, ToolPipeline};
use harness_tools::ToolCall;

use crate::context::{ConfigurationError, ContextManager, PrepareOptions};
use crate::events::{EventBus, EventKind, HarnessEvent, TerminationReason};
use crate::guard::DoomLoopGuard;
use crate::pool::{AgentLoopFactory, ChildAgentContext, ChildStatus, ChildSuccess, SubAgentPool};

/// One model turn's outcome, before termination is decided.
#[derive(Debug, Clone)]
pub enum StepResult {
    Text { content: String },
    ToolCalls { tool_calls: Vec<ToolCallRequest>, content: Option<String> },
    Error { error: String },
}

/// Outcome of a full agent loop run.
#[derive(Debug, Clone)]
pub struct AgentLoopResult {
    pub messages: Vec<Message>,
    pub steps_used: u32,
    pub limit_reached: bool,
    pub aborted: bool,
    pub termination_reason: TerminationReason,
}

/// A tool call classified as wanting to spawn a sub-agent rather than run
/// through the tool pipeline. Embedders that register a "delegate to a
/// sub-agent" tool implement this to route matching calls to a
/// [`SubAgentPool`] instead of a [`ToolPipeline`].
pub trait DelegationClassifier: Send + Sync {
    /// Returns the prompt to hand to the sub-agent when `call` should be
    /// delegated, or `None` if the call is an ordinary tool call.
    fn classify(&self, call: &ToolCall) -> Option<String>;
}

/// Default classifier: no call is ever a delegation. Every call is routed
/// through permission checking and the tool pipeline as normal.
pub struct NeverDelegate;

impl DelegationClassifier for NeverDelegate {
    fn classify(&self, _call: &ToolCall) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AgentLoopConfig {
    pub max_steps: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self { max_steps: 25 }
    }
}

impl AgentLoopConfig {
    /// Builds a config from a possibly out-of-range step count: negative
    /// values clamp to zero (a loop that never calls the model) rather than
    /// panicking or wrapping.
    pub fn new(max_steps: i64) -> Self {
        let max_steps = if max_steps.is_negative() { 0 } else { max_steps as u32 };
        Self { max_steps }
    }
}

/// Drives the model ↔ tool loop described by `AgentLoopResult`. Holds no
/// conversation state of its own — callers own the message list and pass it
/// in fresh (or continued) on every `run`.
#[derive(Clone)]
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    context: Arc<ContextManager>,
    pipeline: Option<Arc<ToolPipeline>>,
    permission: Arc<dyn PermissionChecker>,
    classifier: Arc<dyn DelegationClassifier>,
    pool: Option<Arc<SubAgentPool>>,
    config: AgentLoopConfig,
    doom_loop_config: DoomLoopConfig,
    event_bus: Option<Arc<EventBus>>,
    tools: Vec<ToolSchema>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        context: Arc<ContextManager>,
        permission: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            provider,
            context,
            pipeline: None,
            permission,
            classifier: Arc::new(NeverDelegate),
            pool: None,
            config: AgentLoopConfig::default(),
            doom_loop_config: DoomLoopConfig::default(),
            event_bus: None,
            tools: Vec::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<ToolPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_pool(mut self, pool: Arc<SubAgentPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DelegationClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_config(mut self, config: AgentLoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_doom_loop_config(mut self, config: DoomLoopConfig) -> Self {
        self.doom_loop_config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    fn emit(&self, kind: EventKind) {
        if let Some(bus) = &self.event_bus {
            bus.emit(HarnessEvent::new(kind));
        }
    }

    async fn prepare(&self, messages: &[Message], options: &PrepareOptions) -> Result<Vec<Message>, ConfigurationError> {
        self.context.prepare(messages.to_vec(), options.clone()).await
    }

    /// Run the full loop to termination.
    pub async fn run(&self, messages: Vec<Message>, cancel: CancelToken, options: PrepareOptions) -> AgentLoopResult {
        self.run_inner(messages, cancel, options, DoomLoopGuard::new(&self.doom_loop_config))
            .await
    }

    async fn run_inner(
        &self,
        mut messages: Vec<Message>,
        cancel: CancelToken,
        options: PrepareOptions,
        mut guard: DoomLoopGuard,
    ) -> AgentLoopResult {
        let mut steps_used = 0u32;

        loop {
            if cancel.is_cancelled() {
                self.emit(EventKind::Aborted { reason: None });
                return self.finish(messages, steps_used, false, true, TerminationReason::Aborted);
            }

            if steps_used >= self.config.max_steps {
                return self.forced_completion(messages, steps_used, &options, &cancel).await;
            }

            let prepared = match self.prepare(&messages, &options).await {
                Ok(m) => m,
                Err(err) => {
                    self.emit(EventKind::Error { message: err.to_string() });
                    return self.finish(messages, steps_used, false, false, TerminationReason::Error);
                }
            };

            let step = self.call_provider(&prepared, true, &cancel).await;

            match step {
                StepResult::Error { error } => {
                    self.emit(EventKind::Error { message: error });
                    return self.finish(messages, steps_used, false, false, TerminationReason::Error);
                }
                StepResult::Text { content } => {
                    if !content.is_empty() {
                        messages.push(Message::assistant(content.clone()));
                    }
                    self.emit(EventKind::Done {
                        termination_reason: TerminationReason::TextOnlyResponse,
                        steps_used,
                        content,
                    });
                    return self.finish(messages, steps_used, false, false, TerminationReason::TextOnlyResponse);
                }
                StepResult::ToolCalls { tool_calls, content } => {
                    let round_content = content.clone().unwrap_or_default();
                    messages.push(Message::assistant_with_tool_calls(round_content.clone(), tool_calls.clone()));

                    if cancel.is_cancelled() {
                        self.emit(EventKind::Aborted { reason: None });
                        return self.finish(messages, steps_used, false, true, TerminationReason::Aborted);
                    }

                    steps_used += 1;

                    let calls: Vec<ToolCall> = tool_calls
                        .iter()
                        .map(|tc| ToolCall::new(tc.id.clone(), tc.name.clone(), tc.arguments.clone()))
                        .collect();
                    guard.track(&calls);

                    let results = self.dispatch_calls(&tool_calls, &cancel).await;
                    for result in &results {
                        match result.status {
                            PipelineStatus::Error => guard.record_failure(&result.name),
                            _ => guard.record_success(&result.name),
                        }
                        messages.push(Message::tool_result(result.call_id.clone(), result.output.clone()));
                    }

                    if guard.should_escalate() {
                        self.emit(EventKind::Done {
                            termination_reason: TerminationReason::DoomLoopDetected,
                            steps_used,
                            content: round_content,
                        });
                        return self.finish(messages, steps_used, false, false, TerminationReason::DoomLoopDetected);
                    }
                }
            }
        }
    }

    /// The step budget is exhausted. Give the model one final, tool-free turn
    /// so it can report what it finished and what remains, then stop
    /// regardless of what (if anything) that turn produces.
    async fn forced_completion(
        &self,
        mut messages: Vec<Message>,
        steps_used: u32,
        options: &PrepareOptions,
        cancel: &CancelToken,
    ) -> AgentLoopResult {
        let mut final_content = String::new();
        if let Ok(prepared) = self.prepare(&messages, options).await {
            if let StepResult::Text { content } = self.call_provider(&prepared, false, cancel).await {
                if !content.is_empty() {
                    messages.push(Message::assistant(content.clone()));
                }
                final_content = content;
            }
        }
        self.emit(EventKind::Done {
            termination_reason: TerminationReason::MaxStepsReached,
            steps_used,
            content: final_content,
        });
        self.finish(messages, steps_used, true, false, TerminationReason::MaxStepsReached)
    }

    fn finish(
        &self,
        messages: Vec<Message>,
        steps_used: u32,
        limit_reached: bool,
        aborted: bool,
        termination_reason: TerminationReason,
    ) -> AgentLoopResult {
        AgentLoopResult {
            messages,
            steps_used,
            limit_reached,
            aborted,
            termination_reason,
        }
    }

    /// Call the provider once and accumulate its stream into a [`StepResult`].
    async fn call_provider(&self, messages: &[Message], with_tools: bool, cancel: &CancelToken) -> StepResult {
        let tools = if with_tools { self.tools.clone() } else { Vec::new() };
        let request = CompletionRequest {
            model: None,
            messages: messages.to_vec(),
            tools,
            system_prompt: None,
            thinking_level: None,
            cache_key: None,
        };

        self.emit(EventKind::MessageStart { role: "assistant".into() });

        let mut stream = match self.provider.stream(request).await {
            Ok(stream) => stream,
            Err(err) => return StepResult::Error { error: err.to_string() },
        };

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return StepResult::Error { error: "aborted".into() };
            }
            match event {
                Ok(StreamEvent::Token(delta)) => {
                    text.push_str(&delta);
                    self.emit(EventKind::Token { text: delta });
                }
                Ok(StreamEvent::Thinking(delta)) => {
                    self.emit(EventKind::Thinking { text: delta });
                }
                Ok(StreamEvent::ToolCallStart(call)) => tool_calls.push(call),
                Ok(StreamEvent::Error(message)) => return StepResult::Error { error: message },
                Ok(StreamEvent::Done { finish_reason, .. }) => {
                    return match finish_reason {
                        FinishReason::ToolUse if !tool_calls.is_empty() => StepResult::ToolCalls {
                            tool_calls,
                            content: if text.is_empty() { None } else { Some(text) },
                        },
                        FinishReason::Error => StepResult::Error {
                            error: "provider reported an error".into(),
                        },
                        _ => StepResult::Text { content: text },
                    };
                }
                Err(err) => return StepResult::Error { error: err.to_string() },
            }
        }

        if !tool_calls.is_empty() {
            StepResult::ToolCalls {
                tool_calls,
                content: if text.is_empty() { None } else { Some(text) },
            }
        } else {
            StepResult::Text { content: text }
        }
    }

    async fn dispatch_calls(
        &self,
        calls: &[ToolCallRequest],
        cancel: &CancelToken,
    ) -> Vec<harness_tools::ToolPipelineResult> {
        let mut futures = Vec::with_capacity(calls.len());
        for call in calls {
            futures.push(self.dispatch_call(call, cancel));
        }
        futures::future::join_all(futures).await
    }

    /// Classify a single call: delegation, permission-denied, or forward to
    /// the tool pipeline. Every call produces exactly one result.
    async fn dispatch_call(&self, call: &ToolCallRequest, cancel: &CancelToken) -> harness_tools::ToolPipelineResult {
        let tool_call = ToolCall::new(call.id.clone(), call.name.clone(), call.arguments.clone());

        if let Some(prompt) = self.classifier.classify(&tool_call) {
            return self.run_delegation(tool_call, prompt).await;
        }

        self.emit(EventKind::PermissionRequest { call: tool_call.clone() });
        if !self.permission.request_permission(&tool_call).await {
            return harness_tools::ToolPipelineResult::synthetic_error(
                &tool_call,
                format!("Permission denied for tool: {}", tool_call.name),
            );
        }

        match &self.pipeline {
            Some(pipeline) => pipeline.execute(tool_call, ToolContext::new(cancel.clone())).await,
            None => harness_tools::ToolPipelineResult::synthetic_error(&tool_call, "Tool pipeline is not configured"),
        }
    }

    async fn run_delegation(&self, tool_call: ToolCall, prompt: String) -> harness_tools::ToolPipelineResult {
        let Some(pool) = &self.pool else {
            return harness_tools::ToolPipelineResult::synthetic_error(&tool_call, "Sub-agent pool is not configured");
        };
        let result = pool.run(tool_call.id.clone(), prompt, self.config.max_steps).await;
        match result.status {
            ChildStatus::Done => harness_tools::ToolPipelineResult {
                call_id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                status: PipelineStatus::Success,
                output: format!("Sub-agent completed after {} step(s)", result.steps_used),
                duration_ms: 0,
                truncated: None,
                original_length: None,
            },
            _ => harness_tools::ToolPipelineResult::synthetic_error(
                &tool_call,
                result.error.unwrap_or_else(|| "sub-agent failed".into()),
            ),
        }
    }
}

/// Lets an [`AgentLoop`] serve as the factory a [`SubAgentPool`] spawns
/// children through, so delegation can recurse: a child run reuses the same
/// provider, tool pipeline, and permission policy as its parent, scoped to
/// the step budget and cancellation token the pool assigns it.
#[async_trait]
impl AgentLoopFactory for AgentLoop {
    async fn run(&self, ctx: ChildAgentContext, prompt: String) -> Result<ChildSuccess, String> {
        let mut child = self.clone();
        child.config.max_steps = ctx.max_steps;
        child.event_bus = ctx.event_bus;

        let messages = vec![Message::user(prompt)];
        let result = child
            .run_inner(messages, ctx.cancel, PrepareOptions::default(), ctx.doom_loop_guard)
            .await;

        if result.aborted {
            return Err("aborted".into());
        }
        match result.termination_reason {
            TerminationReason::Error => Err("child agent loop errored".into()),
            _ => Ok(ChildSuccess { steps_used: result.steps_used }),
        }
    }
}
