// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::events::{EventSink, NullSink, PipelineEvent};
use crate::executor::{ToolContext, ToolExecutor};
use crate::tool::{PipelineStatus, ToolCall, ToolPipelineResult};

/// Runs before the executor is invoked. Returning `Err` short-circuits the
/// call with a synthetic error result — the executor and after-hooks never
/// run. Permission policy is deliberately not a hook: the caller classifies
/// and denies calls before they ever reach the pipeline.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<(), String>;
}

/// Runs after the executor produces a result (whatever its status), and may
/// rewrite it — e.g. to redact secrets before the result reaches the model.
#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn run(&self, result: ToolPipelineResult) -> ToolPipelineResult;
}

const TRUNCATION_SUFFIX: &str = "\n...(truncated)";

/// Configuration for a [`ToolPipeline`], mirroring `harness-config`'s
/// `ToolsConfig` so callers can build one directly from a loaded `Config`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub timeout: Duration,
    pub max_output_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_length: 4000,
        }
    }
}

/// Executes tool calls through the fixed pipeline:
/// abort check, start event, before-hooks, timeout-bounded execution,
/// output normalisation/truncation, after-hooks, end event. Permission
/// checks and delegation routing happen one layer up, in the agent loop's
/// call classification — this pipeline only ever sees calls already cleared
/// to run.
pub struct ToolPipeline {
    executor: Arc<dyn ToolExecutor>,
    config: PipelineConfig,
    before_hooks: Vec<Arc<dyn BeforeHook>>,
    after_hooks: Vec<Arc<dyn AfterHook>>,
    sink: Arc<dyn EventSink>,
}

impl ToolPipeline {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            executor,
            config: PipelineConfig::default(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_before_hook(mut self, hook: Arc<dyn BeforeHook>) -> Self {
        self.before_hooks.push(hook);
        self
    }

    pub fn with_after_hook(mut self, hook: Arc<dyn AfterHook>) -> Self {
        self.after_hooks.push(hook);
        self
    }

    /// Execute a single tool call end to end. Never returns `Err` — every
    /// failure mode (abort, before-hook rejection, timeout, executor error)
    /// is folded into an `error`-status [`ToolPipelineResult`] so callers
    /// always get exactly one result per call.
    #[instrument(skip(self, ctx), fields(tool = %call.name, call_id = %call.id))]
    pub async fn execute(&self, call: ToolCall, ctx: ToolContext) -> ToolPipelineResult {
        // Step 1: abort check.
        if ctx.cancel.is_cancelled() {
            return ToolPipelineResult::synthetic_error(&call, "Tool execution aborted");
        }

        // Step 2: tool_call_start event.
        self.sink.emit(PipelineEvent::ToolCallStart {
            call: call.clone(),
        });

        let mut result = self.execute_inner(&call, &ctx).await;

        // Step 7: after-hooks (errors swallowed — observation only).
        for hook in &self.after_hooks {
            result = hook.run(result).await;
        }

        // Step 8: tool_call_end event (always fires, success or error).
        self.sink.emit(PipelineEvent::ToolCallEnd {
            result: result.clone(),
        });
        result
    }

    async fn execute_inner(&self, call: &ToolCall, ctx: &ToolContext) -> ToolPipelineResult {
        // Step 3: before-hooks, in registration order.
        for hook in &self.before_hooks {
            if let Err(reason) = hook.run(call, ctx).await {
                return ToolPipelineResult::synthetic_error(call, reason);
            }
        }

        if ctx.cancel.is_cancelled() {
            return ToolPipelineResult::synthetic_error(call, "Tool execution aborted");
        }

        // Step 4: timeout-bounded executor call.
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, self.executor.execute(call, ctx)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(message)) => {
                warn!(error = %message, "tool execution failed");
                return ToolPipelineResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    status: PipelineStatus::Error,
                    output: message,
                    duration_ms,
                    truncated: None,
                    original_length: None,
                };
            }
            Err(_) => {
                warn!(timeout_ms = self.config.timeout.as_millis() as u64, "tool call timed out");
                return ToolPipelineResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    status: PipelineStatus::Error,
                    output: format!("tool call timed out after {}ms", self.config.timeout.as_millis()),
                    duration_ms,
                    truncated: None,
                    original_length: None,
                };
            }
        };

        // Step 5 & 6: normalise/truncate.
        let output = raw.into_output_string();
        self.normalise(call, output, duration_ms)
    }

    fn normalise(&self, call: &ToolCall, output: String, duration_ms: u64) -> ToolPipelineResult {
        let limit = self.config.max_output_length;
        if limit == 0 || output.len() <= limit {
            return ToolPipelineResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                status: PipelineStatus::Success,
                output,
                duration_ms,
                truncated: None,
                original_length: None,
            };
        }

        let original_length = output.len();
        let keep = limit.saturating_sub(TRUNCATION_SUFFIX.len());
        let mut boundary = keep.min(output.len());
        while boundary > 0 && !output.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let mut truncated_output = output[..boundary].to_string();
        truncated_output.push_str(TRUNCATION_SUFFIX);

        ToolPipelineResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: PipelineStatus::Truncated,
            output: truncated_output,
            duration_ms,
            truncated: Some(true),
            original_length: Some(original_length),
        }
    }

    /// Execute a batch of calls, isolating each call's failure from the
    /// others. Calls run concurrently; the returned vector preserves input
    /// order.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        ctx: ToolContext,
    ) -> Vec<ToolPipelineResult> {
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            let ctx = ctx.clone();
            handles.push(self.execute(call, ctx));
        }
        futures::future::join_all(handles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RawToolOutput;
    use harness_model::CancelToken;

    struct Echo;
    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<RawToolOutput, String> {
            Ok(RawToolOutput::Text(format!("ran {}", call.name)))
        }
    }

    struct Failing;
    #[async_trait]
    impl ToolExecutor for Failing {
        async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<RawToolOutput, String> {
            Err("boom".into())
        }
    }

    struct Slow;
    #[async_trait]
    impl ToolExecutor for Slow {
        async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<RawToolOutput, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RawToolOutput::Text("late".into()))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(CancelToken::new())
    }

    #[tokio::test]
    async fn successful_call_yields_success_status() {
        let pipeline = ToolPipeline::new(Arc::new(Echo));
        let call = ToolCall::new("c1", "echo", serde_json::json!({}));
        let result = pipeline.execute(call, ctx()).await;
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.output, "ran echo");
    }

    #[tokio::test]
    async fn aborted_context_short_circuits() {
        let pipeline = ToolPipeline::new(Arc::new(Echo));
        let cancel = CancelToken::new();
        cancel.cancel();
        let call = ToolCall::new("c1", "echo", serde_json::json!({}));
        let result = pipeline.execute(call, ToolContext::new(cancel)).await;
        assert_eq!(result.status, PipelineStatus::Error);
        assert!(result.output.contains("aborted"));
    }

    #[tokio::test]
    async fn before_hook_rejection_short_circuits_without_running_executor() {
        struct Deny;
        #[async_trait]
        impl BeforeHook for Deny {
            async fn run(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<(), String> {
                Err("blocked by policy".into())
            }
        }
        let pipeline = ToolPipeline::new(Arc::new(Failing)).with_before_hook(Arc::new(Deny));
        let call = ToolCall::new("c1", "shell", serde_json::json!({}));
        let result = pipeline.execute(call, ctx()).await;
        assert_eq!(result.status, PipelineStatus::Error);
        assert_eq!(result.output, "blocked by policy");
    }

    #[tokio::test]
    async fn executor_error_is_wrapped_not_truncated() {
        let pipeline = ToolPipeline::new(Arc::new(Failing));
        let call = ToolCall::new("c1", "shell", serde_json::json!({}));
        let result = pipeline.execute(call, ctx()).await;
        assert_eq!(result.status, PipelineStatus::Error);
        assert_eq!(result.output, "boom");
        assert!(result.truncated.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_executor_times_out() {
        let pipeline = ToolPipeline::new(Arc::new(Slow))
            .with_config(PipelineConfig { timeout: Duration::from_millis(50), ..Default::default() });
        let call = ToolCall::new("c1", "slow", serde_json::json!({}));
        let result = pipeline.execute(call, ctx()).await;
        assert_eq!(result.status, PipelineStatus::Error);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_suffix_and_flag() {
        struct Big;
        #[async_trait]
        impl ToolExecutor for Big {
            async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<RawToolOutput, String> {
                Ok(RawToolOutput::Text("x".repeat(10_000)))
            }
        }
        let pipeline = ToolPipeline::new(Arc::new(Big))
            .with_config(PipelineConfig { timeout: Duration::from_secs(5), max_output_length: 100 });
        let call = ToolCall::new("c1", "big", serde_json::json!({}));
        let result = pipeline.execute(call, ctx()).await;
        assert_eq!(result.status, PipelineStatus::Truncated);
        assert_eq!(result.truncated, Some(true));
        assert_eq!(result.original_length, Some(10_000));
        assert!(result.output.ends_with("...(truncated)"));
        assert!(result.output.len() <= 100);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        struct Sometimes;
        #[async_trait]
        impl ToolExecutor for Sometimes {
            async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<RawToolOutput, String> {
                if call.name == "bad" {
                    Err("nope".into())
                } else {
                    Ok(RawToolOutput::Text("ok".into()))
                }
            }
        }
        let pipeline = ToolPipeline::new(Arc::new(Sometimes));
        let calls = vec![
            ToolCall::new("c1", "good", serde_json::json!({})),
            ToolCall::new("c2", "bad", serde_json::json!({})),
            ToolCall::new("c3", "good", serde_json::json!({})),
        ];
        let results = pipeline.execute_batch(calls, ctx()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, PipelineStatus::Success);
        assert_eq!(results[1].status, PipelineStatus::Error);
        assert_eq!(results[2].status, PipelineStatus::Success);
    }
}
