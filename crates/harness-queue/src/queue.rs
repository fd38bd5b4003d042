// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The persistent work list: `enqueue`, `dequeue`, and the state-transition
//! helpers the worker manager and any direct caller use to drive a task
//! through `pending → running → {complete, failed}`.
use std::sync::Arc;

use chrono::Utc;

use crate::store::TaskStore;
use crate::task::{TaskPatch, TaskRecord, TaskStatus};

/// Thin orchestration layer over a [`TaskStore`]. Holds no state of its own
/// beyond the store handle — every method is a read or a conditional write
/// against the store.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn enqueue(&self, prompt: impl Into<String>) -> TaskRecord {
        self.store.create(prompt.into()).await
    }

    pub async fn get_task(&self, id: &str) -> Option<TaskRecord> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        self.store.list().await
    }

    /// Walk the pending list newest-to-oldest and claim the first row whose
    /// conditional `pending → running` update succeeds. This is LIFO: a
    /// backlog favours recently-submitted work over stale work.
    pub async fn dequeue(&self, worker_id: impl Into<String>) -> Option<TaskRecord> {
        let worker_id = worker_id.into();
        let mut pending: Vec<TaskRecord> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for candidate in pending {
            let patch = TaskPatch::start(Utc::now(), worker_id.clone());
            if let Some(claimed) = self.store.update(&candidate.id, patch, Some(TaskStatus::Pending)).await {
                return Some(claimed);
            }
        }
        None
    }

    pub async fn start(&self, id: &str, worker_id: impl Into<String>) -> Option<TaskRecord> {
        self.store
            .update(id, TaskPatch::start(Utc::now(), worker_id), Some(TaskStatus::Pending))
            .await
    }

    pub async fn complete(&self, id: &str, result: impl Into<String>) -> Option<TaskRecord> {
        self.store
            .update(id, TaskPatch::complete(Utc::now(), result), Some(TaskStatus::Running))
            .await
    }

    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Option<TaskRecord> {
        self.store
            .update(id, TaskPatch::fail(Utc::now(), error), Some(TaskStatus::Running))
            .await
    }

    /// Creates a new pending task from a `failed` source's prompt. The
    /// original row is left untouched (still `failed`) — this is a retry by
    /// resubmission, not a resurrection of the original row.
    pub async fn retry(&self, id: &str) -> Option<TaskRecord> {
        let source = self.store.get(id).await?;
        if source.status != TaskStatus::Failed {
            return None;
        }
        Some(self.store.create(source.prompt).await)
    }

    /// Bulk-fails every `running` row, for use immediately after a process
    /// restart: nothing can still be "running" if the process that was
    /// running it just started.
    pub async fn recover_from_restart(&self, reason: impl Into<String>) -> usize {
        self.store.fail_running_tasks(&reason.into()).await
    }
}
