// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable task queue and background worker supervision: the asynchronous,
//! fire-and-poll counterpart to the synchronous agent loop in
//! `harness-core`. A caller enqueues a prompt, gets a task id back
//! immediately, and polls or is notified later once a worker has run it to
//! completion or failure.
mod queue;
mod store;
mod task;
mod worker;

pub use queue::TaskQueue;
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{TaskPatch, TaskRecord, TaskStatus};
pub use worker::{TaskExecutor, WorkerExecutionContext, WorkerManager};
