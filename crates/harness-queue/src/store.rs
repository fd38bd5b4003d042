// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `TaskStore` capability and an in-memory reference implementation.
//!
//! A production deployment backs this with a durable, transactional store
//! (SQLite in WAL mode is the natural choice); that is explicitly an
//! external collaborator's concern — the `harness-queue` tests and any
//! embedder that hasn't stood up persistence yet use [`InMemoryTaskStore`]
//! instead. The conditional update in [`TaskStore::update`]
//! is the one piece every implementation must get right: a losing writer
//! observes `None` and must retry or skip, never silently overwrite another
//! writer's transition.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::task::{TaskPatch, TaskRecord, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, prompt: String) -> TaskRecord;
    async fn get(&self, id: &str) -> Option<TaskRecord>;
    async fn list(&self) -> Vec<TaskRecord>;

    /// Apply `patch` to the row `id`, but only if `expected_status` is
    /// either `None` or equal to the row's current status. Returns the
    /// updated row on success, `None` if the row is missing or the
    /// expectation didn't hold (a losing writer in a race).
    async fn update(&self, id: &str, patch: TaskPatch, expected_status: Option<TaskStatus>) -> Option<TaskRecord>;

    async fn delete(&self, id: &str) -> bool;

    /// Count of `complete` rows with `delivered = false`.
    async fn count_undelivered_completed(&self) -> usize;

    /// Bulk-transition every `running` row to `failed` with the given
    /// reason, in one step. Used by [`crate::queue::TaskQueue::recover_from_restart`].
    async fn fail_running_tasks(&self, reason: &str) -> usize;
}

/// In-memory reference [`TaskStore`]. Single-process only; state is lost on
/// restart (the worker manager's `recover_from_restart` path exists
/// precisely because a real, durable store doesn't share that property).
#[derive(Default)]
pub struct InMemoryTaskStore {
    rows: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(record: &mut TaskRecord, patch: TaskPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(result) = patch.result {
        record.result = Some(result);
    }
    if let Some(error) = patch.error {
        record.error = Some(error);
    }
    if let Some(conversation_id) = patch.conversation_id {
        record.conversation_id = Some(conversation_id);
    }
    if let Some(started_at) = patch.started_at {
        record.started_at = Some(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        record.completed_at = Some(completed_at);
    }
    if let Some(worker_id) = patch.worker_id {
        record.worker_id = Some(worker_id);
    }
    if let Some(delivered) = patch.delivered {
        record.delivered = delivered;
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, prompt: String) -> TaskRecord {
        let record = TaskRecord::new(Uuid::new_v4().to_string(), prompt, Utc::now());
        self.rows.lock().unwrap().insert(record.id.clone(), record.clone());
        record
    }

    async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    async fn list(&self) -> Vec<TaskRecord> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    async fn update(&self, id: &str, patch: TaskPatch, expected_status: Option<TaskStatus>) -> Option<TaskRecord> {
        let mut rows = self.rows.lock().unwrap();
        let record = rows.get_mut(id)?;
        if let Some(expected) = expected_status {
            if record.status != expected {
                return None;
            }
        }
        apply_patch(record, patch);
        Some(record.clone())
    }

    async fn delete(&self, id: &str) -> bool {
        self.rows.lock().unwrap().remove(id).is_some()
    }

    async fn count_undelivered_completed(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TaskStatus::Complete && !t.delivered)
            .count()
    }

    async fn fail_running_tasks(&self, reason: &str) -> usize {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut count = 0;
        for record in rows.values_mut() {
            if record.status == TaskStatus::Running {
                record.status = TaskStatus::Failed;
                record.error = Some(reason.to_string());
                record.completed_at = Some(now);
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryTaskStore::new();
        let created = store.create("do the thing".into()).await;
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn conditional_update_rejects_mismatched_expectation() {
        let store = InMemoryTaskStore::new();
        let created = store.create("x".into()).await;
        let result = store
            .update(&created.id, TaskPatch::start(Utc::now(), "w1"), Some(TaskStatus::Running))
            .await;
        assert!(result.is_none());
        assert_eq!(store.get(&created.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn conditional_update_applies_when_expectation_matches() {
        let store = InMemoryTaskStore::new();
        let created = store.create("x".into()).await;
        let result = store
            .update(&created.id, TaskPatch::start(Utc::now(), "w1"), Some(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Running);
        assert_eq!(result.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn racing_writers_only_one_wins() {
        let store = InMemoryTaskStore::new();
        let created = store.create("x".into()).await;
        let first = store
            .update(&created.id, TaskPatch::start(Utc::now(), "w1"), Some(TaskStatus::Pending))
            .await;
        let second = store
            .update(&created.id, TaskPatch::start(Utc::now(), "w2"), Some(TaskStatus::Pending))
            .await;
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fail_running_tasks_bulk_transitions() {
        let store = InMemoryTaskStore::new();
        let a = store.create("a".into()).await;
        let b = store.create("b".into()).await;
        store.update(&a.id, TaskPatch::start(Utc::now(), "w1"), Some(TaskStatus::Pending)).await;
        store.update(&b.id, TaskPatch::start(Utc::now(), "w2"), Some(TaskStatus::Pending)).await;
        let count = store.fail_running_tasks("daemon restart").await;
        assert_eq!(count, 2);
        assert_eq!(store.get(&a.id).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(store.get(&a.id).await.unwrap().error.as_deref(), Some("daemon restart"));
    }

    #[tokio::test]
    async fn count_undelivered_completed_ignores_delivered_rows() {
        let store = InMemoryTaskStore::new();
        let a = store.create("a".into()).await;
        store.update(&a.id, TaskPatch::start(Utc::now(), "w1"), Some(TaskStatus::Pending)).await;
        store.update(&a.id, TaskPatch::complete(Utc::now(), "done"), Some(TaskStatus::Running)).await;
        assert_eq!(store.count_undelivered_completed().await, 1);
        store
            .update(
                &a.id,
                TaskPatch { delivered: Some(true), ..Default::default() },
                None,
            )
            .await;
        assert_eq!(store.count_undelivered_completed().await, 0);
    }
}
