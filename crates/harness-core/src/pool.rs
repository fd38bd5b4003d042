// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Semaphore-bounded parallel execution of child agent loops, with
//! cooperative cancellation propagated from parent to every child and event
//! forwarding tagged with the child's id.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harness_config::{DoomLoopConfig, PoolConfig};
use harness_model::CancelToken;
use tokio::sync::Semaphore;

use crate::events::{EventBus, EventType, HarnessEvent, Unsubscribe};
use crate::guard::DoomLoopGuard;

const ALL_EVENT_TYPES: [EventType; 11] = [
    EventType::MessageStart,
    EventType::Token,
    EventType::Thinking,
    EventType::ToolCallStart,
    EventType::ToolCallEnd,
    EventType::Compaction,
    EventType::Error,
    EventType::Done,
    EventType::PermissionRequest,
    EventType::Aborted,
    EventType::ChildAgentEvent,
];

/// What a pool-owned child run hands the injected factory.
pub struct ChildAgentContext {
    pub max_steps: u32,
    pub cancel: CancelToken,
    pub doom_loop_guard: DoomLoopGuard,
    pub event_bus: Option<Arc<EventBus>>,
}

/// Outcome of a completed child run, returned by the factory.
pub struct ChildSuccess {
    pub steps_used: u32,
}

/// The narrow capability the pool delegates child execution to. Production
/// callers inject a factory that builds and runs a real agent loop; tests
/// may use a default that simply echoes the prompt back as the final text.
#[async_trait]
pub trait AgentLoopFactory: Send + Sync {
    async fn run(&self, ctx: ChildAgentContext, prompt: String) -> Result<ChildSuccess, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// Observable state for one child task.
#[derive(Debug, Clone)]
pub struct ChildState {
    pub id: String,
    pub status: ChildStatus,
    pub steps_used: u32,
    pub prompt: String,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Final result of one child run, returned to the caller that requested it.
#[derive(Debug, Clone)]
pub struct ChildResult {
    pub id: String,
    pub status: ChildStatus,
    pub steps_used: u32,
    pub error: Option<String>,
    /// `true` when the run ended because its cancellation token fired,
    /// rather than because the factory returned an error.
    pub aborted: bool,
}

fn truncate_prompt(prompt: &str) -> String {
    let chars: Vec<char> = prompt.chars().collect();
    if chars.len() <= 100 {
        prompt.to_string()
    } else {
        let mut s: String = chars[..100].iter().collect();
        s.push('…');
        s
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn forward_all(child_bus: &Arc<EventBus>, parent_bus: &Arc<EventBus>, child_id: &str) -> Vec<Unsubscribe> {
    ALL_EVENT_TYPES
        .iter()
        .map(|&event_type| {
            let parent = parent_bus.clone();
            let cid = child_id.to_string();
            child_bus.on(event_type, move |event: &HarnessEvent| {
                parent.emit(event.clone().into_child_event(cid.clone()));
            })
        })
        .collect()
}

pub struct SubAgentPool {
    factory: Arc<dyn AgentLoopFactory>,
    semaphore: Arc<Semaphore>,
    parent_cancel: Option<CancelToken>,
    parent_bus: Option<Arc<EventBus>>,
    doom_loop_config: DoomLoopConfig,
    states: Arc<Mutex<HashMap<String, ChildState>>>,
}

impl SubAgentPool {
    pub fn new(
        factory: Arc<dyn AgentLoopFactory>,
        pool_config: &PoolConfig,
        doom_loop_config: DoomLoopConfig,
        parent_cancel: Option<CancelToken>,
        parent_bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(pool_config.resolve_max_concurrent())),
            parent_cancel,
            parent_bus,
            doom_loop_config,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state_of(&self, id: &str) -> Option<ChildState> {
        self.states.lock().unwrap().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.states
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == ChildStatus::Running)
            .count()
    }

    fn set_state(&self, id: &str, mutate: impl FnOnce(&mut ChildState)) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(id) {
            mutate(state);
        }
    }

    async fn run_one(self: Arc<Self>, id: String, prompt: String, max_steps: u32) -> ChildResult {
        let child_cancel = CancelToken::new();
        if let Some(parent) = self.parent_cancel.clone() {
            if parent.is_cancelled() {
                child_cancel.cancel();
            } else {
                let child_clone = child_cancel.clone();
                tokio::spawn(async move {
                    parent.cancelled().await;
                    child_clone.cancel();
                });
            }
        }

        {
            let mut states = self.states.lock().unwrap();
            states.insert(
                id.clone(),
                ChildState {
                    id: id.clone(),
                    status: ChildStatus::Queued,
                    steps_used: 0,
                    prompt: truncate_prompt(&prompt),
                    started_at: None,
                    completed_at: None,
                },
            );
        }

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ChildResult {
                    id,
                    status: ChildStatus::Failed,
                    steps_used: 0,
                    error: Some("pool is shutting down".into()),
                    aborted: false,
                }
            }
        };

        if child_cancel.is_cancelled() {
            drop(permit);
            let completed_at = Some(now_ms());
            self.set_state(&id, |s| {
                s.status = ChildStatus::Failed;
                s.completed_at = completed_at;
            });
            return ChildResult {
                id,
                status: ChildStatus::Failed,
                steps_used: 0,
                error: Some("aborted".into()),
                aborted: true,
            };
        }

        let started_at = Some(now_ms());
        self.set_state(&id, |s| {
            s.status = ChildStatus::Running;
            s.started_at = started_at;
        });

        let guard = DoomLoopGuard::new(&self.doom_loop_config);
        let child_bus = self.parent_bus.as_ref().map(|_| Arc::new(EventBus::new()));
        let _forwarding: Vec<Unsubscribe> = match (&self.parent_bus, &child_bus) {
            (Some(parent_bus), Some(child_bus)) => forward_all(child_bus, parent_bus, &id),
            _ => Vec::new(),
        };

        let ctx = ChildAgentContext {
            max_steps,
            cancel: child_cancel.clone(),
            doom_loop_guard: guard,
            event_bus: child_bus,
        };

        let outcome = self.factory.run(ctx, prompt).await;
        let completed_at = Some(now_ms());
        drop(permit);

        match outcome {
            Ok(success) => {
                self.set_state(&id, |s| {
                    s.status = ChildStatus::Done;
                    s.steps_used = success.steps_used;
                    s.completed_at = completed_at;
                });
                ChildResult {
                    id,
                    status: ChildStatus::Done,
                    steps_used: success.steps_used,
                    error: None,
                    aborted: false,
                }
            }
            Err(message) => {
                let aborted = child_cancel.is_cancelled();
                self.set_state(&id, |s| {
                    s.status = ChildStatus::Failed;
                    s.completed_at = completed_at;
                });
                ChildResult {
                    id,
                    status: ChildStatus::Failed,
                    steps_used: 0,
                    error: Some(message),
                    aborted,
                }
            }
        }
    }

    /// Run one task, blocking on a semaphore permit before starting.
    pub async fn run(self: &Arc<Self>, id: impl Into<String>, prompt: impl Into<String>, max_steps: u32) -> ChildResult {
        self.clone().run_one(id.into(), prompt.into(), max_steps).await
    }

    /// Fan out many tasks concurrently; the semaphore throttles how many run
    /// at once. Returns results in the same order as the input.
    pub async fn run_many(
        self: &Arc<Self>,
        tasks: Vec<(String, String)>,
        max_steps: u32,
    ) -> Vec<ChildResult> {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|(id, prompt)| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run_one(id, prompt, max_steps).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|_| ChildResult {
                id: "unknown".into(),
                status: ChildStatus::Failed,
                steps_used: 0,
                error: Some("child task panicked".into()),
                aborted: false,
            }));
        }
        results
    }
}

/// Default factory for tests: echoes the prompt back as the final text
/// without invoking a real model. Production callers must inject a factory
/// that drives an actual agent loop.
pub struct EchoFactory;

#[async_trait]
impl AgentLoopFactory for EchoFactory {
    async fn run(&self, ctx: ChildAgentContext, prompt: String) -> Result<ChildSuccess, String> {
        if ctx.cancel.is_cancelled() {
            return Err("aborted before start".into());
        }
        let _ = prompt;
        Ok(ChildSuccess { steps_used: 1 })
    }
}
