use crate::tool::{ToolCall, ToolPipelineResult};

/// Lifecycle events the pipeline raises around a single call, emitted before
/// the before-hooks run and after the after-hooks finish. Deliberately
/// decoupled from the core's versioned
/// `HarnessEvent` envelope — `harness-core` bridges these into its own
/// event bus rather than this crate depending back on it.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ToolCallStart { call: ToolCall },
    ToolCallEnd { result: ToolPipelineResult },
}

/// Sink the pipeline pushes [`PipelineEvent`]s into. Implementations must not
/// block or panic; a sink that wants asynchronous fan-out should buffer
/// internally (e.g. an unbounded channel) and return immediately.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// A sink that discards everything. Useful when the caller has no interest
/// in pipeline telemetry.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}
