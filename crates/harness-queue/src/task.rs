// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The durable unit of work the queue and worker manager operate on.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task's lifecycle stage. Transitions are conditional on the current
/// value via [`crate::store::TaskPatch`]'s `expected_status` — see
/// [`crate::store::TaskStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One row of the task store.
///
/// `pending → may transition to running (with worker_id) → then to exactly
/// one of complete or failed`. Every transition is conditional on the
/// expected current status, the core concurrency primitive of this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub delivered: bool,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            conversation_id: None,
            created_at,
            started_at: None,
            completed_at: None,
            worker_id: None,
            delivered: false,
        }
    }
}

/// A partial update applied by [`crate::store::TaskStore::update`]. Every
/// field left `None` is left untouched on the stored row.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub conversation_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub delivered: Option<bool>,
}

impl TaskPatch {
    /// `pending → running`, stamping `started_at` and the claiming worker.
    pub fn start(now: DateTime<Utc>, worker_id: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            started_at: Some(now),
            worker_id: Some(worker_id.into()),
            ..Default::default()
        }
    }

    /// `running → complete`, stamping `completed_at` and the result.
    pub fn complete(now: DateTime<Utc>, result: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Complete),
            completed_at: Some(now),
            result: Some(result.into()),
            ..Default::default()
        }
    }

    /// `running → failed`, stamping `completed_at` and the error.
    pub fn fail(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            completed_at: Some(now),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
