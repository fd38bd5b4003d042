// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Versioned event envelope and a typed pub/sub bus. Consumers (a TUI, a
//! channel delivery pipeline, a CLI) subscribe to drive their own output;
//! the core never assumes anything about who is listening.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use harness_tools::{PipelineEvent as ToolPipelineEvent, ToolCall, ToolPipelineResult};

const EVENT_VERSION: u32 = 1;

/// Why an agent loop run stopped. Exactly one value per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TextOnlyResponse,
    MaxStepsReached,
    DoomLoopDetected,
    Aborted,
    Error,
}

/// The discriminant half of the `{type, payload}` pair, used as a pub/sub
/// routing key independent of any particular event's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageStart,
    Token,
    Thinking,
    ToolCallStart,
    ToolCallEnd,
    Compaction,
    Error,
    Done,
    PermissionRequest,
    Aborted,
    ChildAgentEvent,
}

/// Discriminated payload for one harness event. Adjacently tagged so the
/// wire shape is exactly `{"type": "...", "payload": {...}}` rather than the
/// internally-tagged form, which would inline payload fields alongside
/// `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    MessageStart { role: String },
    Token { text: String },
    Thinking { text: String },
    ToolCallStart { call: ToolCall },
    ToolCallEnd { result: ToolPipelineResult },
    Compaction { tokens_before: usize, tokens_after: usize, strategy: String },
    Error { message: String },
    Done { termination_reason: TerminationReason, steps_used: u32, content: String },
    PermissionRequest { call: ToolCall },
    Aborted { reason: Option<String> },
    ChildAgentEvent { child_id: String, event: Box<HarnessEvent> },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::MessageStart { .. } => EventType::MessageStart,
            EventKind::Token { .. } => EventType::Token,
            EventKind::Thinking { .. } => EventType::Thinking,
            EventKind::ToolCallStart { .. } => EventType::ToolCallStart,
            EventKind::ToolCallEnd { .. } => EventType::ToolCallEnd,
            EventKind::Compaction { .. } => EventType::Compaction,
            EventKind::Error { .. } => EventType::Error,
            EventKind::Done { .. } => EventType::Done,
            EventKind::PermissionRequest { .. } => EventType::PermissionRequest,
            EventKind::Aborted { .. } => EventType::Aborted,
            EventKind::ChildAgentEvent { .. } => EventType::ChildAgentEvent,
        }
    }
}

/// `{type, payload, version, timestamp, eventId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub version: u32,
    pub timestamp: i64,
    pub event_id: String,
}

impl HarnessEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            version: EVENT_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Wrap this event as a `child_agent_event` tagged with `child_id`.
    pub fn into_child_event(self, child_id: impl Into<String>) -> HarnessEvent {
        HarnessEvent::new(EventKind::ChildAgentEvent {
            child_id: child_id.into(),
            event: Box::new(self),
        })
    }
}

type Handler = dyn Fn(&HarnessEvent) + Send + Sync;

/// Typed pub/sub bus. `emit` fans out to every handler registered for the
/// event's type; a panicking handler is caught and logged, never propagated
/// to its siblings or to the emitter.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventType, Vec<(u64, Arc<Handler>)>>>,
    next_id: AtomicU64,
}

/// Token returned by [`EventBus::on`]. Dropping it unsubscribes the handler;
/// [`EventBus::unsubscribe`] is just a named way to drop it early.
pub struct Unsubscribe {
    event_type: EventType,
    id: u64,
    bus: Weak<EventBus>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut handlers = bus.handlers.lock().unwrap();
            if let Some(list) = handlers.get_mut(&self.event_type) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn on<F>(self: &Arc<Self>, event_type: EventType, handler: F) -> Unsubscribe
    where
        F: Fn(&HarnessEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut handlers = self.handlers.lock().unwrap();
            handlers
                .entry(event_type)
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Unsubscribe {
            event_type,
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, token: Unsubscribe) {
        drop(token);
    }

    pub fn emit(&self, event: HarnessEvent) {
        let event_type = event.event_type();
        let snapshot: Vec<Arc<Handler>> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .get(&event_type)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            let event_ref = &event;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event_ref)));
            if result.is_err() {
                tracing::error!(?event_type, "event handler panicked; isolated from other subscribers");
            }
        }
    }
}

/// Bridges the tool pipeline's decoupled [`harness_tools::EventSink`] into
/// this crate's versioned [`HarnessEvent`] envelope, so a `ToolPipeline` can
/// be constructed without `harness-tools` depending back on `harness-core`.
pub struct ToolEventBridge {
    bus: Arc<EventBus>,
}

impl ToolEventBridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl harness_tools::EventSink for ToolEventBridge {
    fn emit(&self, event: ToolPipelineEvent) {
        let kind = match event {
            ToolPipelineEvent::ToolCallStart { call } => EventKind::ToolCallStart { call },
            ToolPipelineEvent::ToolCallEnd { result } => EventKind::ToolCallEnd { result },
        };
        self.bus.emit(HarnessEvent::new(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn event_serialises_as_adjacently_tagged() {
        let event = HarnessEvent::new(EventKind::Token { text: "hi".into() });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["payload"]["text"], "hi");
        assert!(json.get("version").is_some());
        assert!(json.get("eventId").is_some());
    }

    #[test]
    fn bus_only_delivers_to_matching_type() {
        let bus = Arc::new(EventBus::new());
        let token_count = Arc::new(AtomicUsize::new(0));
        let done_count = Arc::new(AtomicUsize::new(0));
        let t = token_count.clone();
        let _token_sub = bus.on(EventType::Token, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let d = done_count.clone();
        let _done_sub = bus.on(EventType::Done, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(HarnessEvent::new(EventKind::Token { text: "x".into() }));
        assert_eq!(token_count.load(Ordering::SeqCst), 1);
        assert_eq!(done_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = bus.on(EventType::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(HarnessEvent::new(EventKind::Error { message: "x".into() }));
        bus.unsubscribe(token);
        bus.emit(HarnessEvent::new(EventKind::Error { message: "x".into() }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_token_unsubscribes_without_an_explicit_call() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = bus.on(EventType::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(HarnessEvent::new(EventKind::Error { message: "x".into() }));
        drop(token);
        bus.emit(HarnessEvent::new(EventKind::Error { message: "x".into() }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_prevent_others_running() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let _panicking_sub = bus.on(EventType::Error, |_| panic!("boom"));
        let c = count.clone();
        let _counting_sub = bus.on(EventType::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(HarnessEvent::new(EventKind::Error { message: "x".into() }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_event_wraps_with_child_id() {
        let inner = HarnessEvent::new(EventKind::Token { text: "hi".into() });
        let wrapped = inner.into_child_event("child-1");
        match wrapped.kind {
            EventKind::ChildAgentEvent { child_id, event } => {
                assert_eq!(child_id, "child-1");
                assert!(matches!(event.kind, EventKind::Token { .. }));
            }
            _ => panic!("expected ChildAgentEvent"),
        }
    }
}
