// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Supervises up to `maxConcurrentWorkers` concurrent task workers, each with
//! its own cancellation token and wall-clock timeout, and recovers rows left
//! `running` by a prior process that never reached shutdown.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harness_config::WorkerConfig;
use harness_model::CancelToken;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::queue::TaskQueue;
use crate::task::TaskRecord;

/// What a worker hands the injected [`TaskExecutor`]. Production callers
/// build a fresh agent loop, tool executor, and permission checker inside
/// their executor implementation, threading `cancel` through as the agent
/// loop's cancellation token — this crate only owns the supervision, not the
/// agent machinery itself.
#[derive(Clone)]
pub struct WorkerExecutionContext {
    pub cancel: CancelToken,
}

/// The narrow capability the worker manager delegates task execution to.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: TaskRecord, ctx: WorkerExecutionContext) -> Result<String, String>;
}

struct WorkerHandle {
    cancel: CancelToken,
    abort_reason: Arc<AsyncMutex<Option<String>>>,
    join: JoinHandle<()>,
}

/// Supervises concurrent task workers against a [`TaskQueue`]. `spawn`
/// enqueues a task id into an internal pending list; [`WorkerManager::drain_queue`]
/// pulls from that list while a semaphore permit is available, claims the row
/// (`pending → running`, stamping a fresh worker id), and runs it.
pub struct WorkerManager {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    pending: Arc<AsyncMutex<VecDeque<String>>>,
    workers: Arc<AsyncMutex<HashMap<String, WorkerHandle>>>,
}

impl WorkerManager {
    pub fn new(queue: Arc<TaskQueue>, executor: Arc<dyn TaskExecutor>, config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            executor,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_workers)),
            config,
            pending: Arc::new(AsyncMutex::new(VecDeque::new())),
            workers: Arc::new(AsyncMutex::new(HashMap::new())),
        })
    }

    /// Enqueue a task id for worker assignment and immediately attempt to
    /// drain the queue (starting it right away if a permit is free).
    pub async fn spawn(self: &Arc<Self>, task_id: impl Into<String>) {
        self.pending.lock().await.push_back(task_id.into());
        self.drain_queue().await;
    }

    /// Pull from the pending list while a permit is available, claiming each
    /// row's `pending → running` transition before starting its worker. A
    /// row another caller has already claimed (or that no longer exists) is
    /// dropped silently — it is no longer this manager's to run.
    pub async fn drain_queue(self: &Arc<Self>) {
        loop {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let task_id = {
                let mut pending = self.pending.lock().await;
                match pending.pop_front() {
                    Some(id) => id,
                    None => {
                        drop(permit);
                        return;
                    }
                }
            };

            let worker_id = uuid::Uuid::new_v4().to_string();
            let Some(task) = self.queue.start(&task_id, worker_id.clone()).await else {
                // Already claimed or gone; permit goes back unused.
                drop(permit);
                continue;
            };

            let manager = self.clone();
            let handle_id = task.id.clone();
            let cancel = CancelToken::new();
            let abort_reason: Arc<AsyncMutex<Option<String>>> = Arc::new(AsyncMutex::new(None));
            let cancel_for_worker = cancel.clone();
            let abort_reason_for_worker = abort_reason.clone();

            let join = tokio::spawn(async move {
                manager
                    .run_worker(task, worker_id, cancel_for_worker, abort_reason_for_worker, permit)
                    .await;
            });

            self.workers.lock().await.insert(
                handle_id,
                WorkerHandle { cancel, abort_reason, join },
            );
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        task: TaskRecord,
        worker_id: String,
        cancel: CancelToken,
        abort_reason: Arc<AsyncMutex<Option<String>>>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let task_id = task.id.clone();
        let ctx = WorkerExecutionContext { cancel: cancel.clone() };
        let timeout = Duration::from_secs(self.config.worker_timeout_secs);
        let mut exec_fut = Box::pin(self.executor.execute(task, ctx));

        let outcome = tokio::select! {
            result = &mut exec_fut => result,
            _ = tokio::time::sleep(timeout) => {
                *abort_reason.lock().await = Some("timeout".to_string());
                warn!(task_id = %task_id, worker_id = %worker_id, "worker timed out");
                cancel.cancel();
                exec_fut.await
            }
            _ = cancel.cancelled() => {
                {
                    let mut reason = abort_reason.lock().await;
                    if reason.is_none() {
                        *reason = Some("cancelled".to_string());
                    }
                }
                exec_fut.await
            }
        };

        let cancelled = cancel.is_cancelled();
        let reason = abort_reason.lock().await.clone();

        match outcome {
            Ok(output) if !cancelled => {
                self.queue.complete(&task_id, output).await;
            }
            Ok(_) => {
                self.queue.fail(&task_id, reason.unwrap_or_else(|| "aborted".to_string())).await;
            }
            Err(message) => {
                let error = if cancelled { reason.unwrap_or(message) } else { message };
                self.queue.fail(&task_id, error).await;
            }
        }

        drop(permit);
        self.workers.lock().await.remove(&task_id);
        self.drain_queue().await;
    }

    /// Request cancellation of a running task. A no-op if the task isn't
    /// currently assigned to a worker (already finished, or never started).
    pub async fn cancel(&self, task_id: &str) {
        let workers = self.workers.lock().await;
        if let Some(handle) = workers.get(task_id) {
            {
                let mut reason = handle.abort_reason.lock().await;
                if reason.is_none() {
                    *reason = Some("cancelled".to_string());
                }
            }
            handle.cancel.cancel();
        }
    }

    /// Cancel every running worker and wait for them all to finish. Workers
    /// are independent: cancelling one never touches another's token.
    pub async fn shutdown(&self) {
        let handles: Vec<(CancelToken, Arc<AsyncMutex<Option<String>>>)> = {
            let workers = self.workers.lock().await;
            workers
                .values()
                .map(|h| (h.cancel.clone(), h.abort_reason.clone()))
                .collect()
        };
        for (cancel, abort_reason) in &handles {
            {
                let mut reason = abort_reason.lock().await;
                if reason.is_none() {
                    *reason = Some("cancelled".to_string());
                }
            }
            cancel.cancel();
        }

        let joins: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, h)| h.join).collect()
        };
        for join in joins {
            let _ = join.await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use crate::task::TaskStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn manager_with(executor: Arc<dyn TaskExecutor>, config: WorkerConfig) -> (Arc<WorkerManager>, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new(Arc::new(InMemoryTaskStore::new())));
        let manager = WorkerManager::new(queue.clone(), executor, config);
        (manager, queue)
    }

    struct Echo;
    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, task: TaskRecord, _ctx: WorkerExecutionContext) -> Result<String, String> {
            Ok(format!("handled: {}", task.prompt))
        }
    }

    #[tokio::test]
    async fn successful_task_transitions_to_complete() {
        let (manager, queue) = manager_with(Arc::new(Echo), WorkerConfig::default());
        let task = queue.enqueue("hello").await;
        manager.spawn(task.id.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let fetched = queue.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Complete);
        assert_eq!(fetched.result.as_deref(), Some("handled: hello"));
    }

    struct AlwaysFails;
    #[async_trait]
    impl TaskExecutor for AlwaysFails {
        async fn execute(&self, _task: TaskRecord, _ctx: WorkerExecutionContext) -> Result<String, String> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn failing_task_transitions_to_failed_with_error() {
        let (manager, queue) = manager_with(Arc::new(AlwaysFails), WorkerConfig::default());
        let task = queue.enqueue("x").await;
        manager.spawn(task.id.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let fetched = queue.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
    }

    struct WaitsForCancel;
    #[async_trait]
    impl TaskExecutor for WaitsForCancel {
        async fn execute(&self, _task: TaskRecord, ctx: WorkerExecutionContext) -> Result<String, String> {
            ctx.cancel.cancelled().await;
            Ok("should not be recorded as success".into())
        }
    }

    #[tokio::test]
    async fn cancel_transitions_to_failed_with_cancelled_reason() {
        let (manager, queue) = manager_with(Arc::new(WaitsForCancel), WorkerConfig::default());
        let task = queue.enqueue("x").await;
        manager.spawn(task.id.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        manager.cancel(&task.id).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let fetched = queue.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("cancelled"));
    }

    struct NeverFinishes;
    #[async_trait]
    impl TaskExecutor for NeverFinishes {
        async fn execute(&self, _task: TaskRecord, ctx: WorkerExecutionContext) -> Result<String, String> {
            ctx.cancel.cancelled().await;
            Err("gave up".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_timeout_fails_task_with_timeout_reason() {
        let (manager, queue) = manager_with(
            Arc::new(NeverFinishes),
            WorkerConfig { max_concurrent_workers: 3, worker_timeout_secs: 1 },
        );
        let task = queue.enqueue("x").await;
        manager.spawn(task.id.clone()).await;
        tokio::time::advance(StdDuration::from_secs(2)).await;
        tokio::task::yield_now().await;
        let fetched = queue.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn concurrency_is_capped_at_configured_max() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        struct Tracking {
            active: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl TaskExecutor for Tracking {
            async fn execute(&self, _task: TaskRecord, _ctx: WorkerExecutionContext) -> Result<String, String> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(StdDuration::from_millis(30)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok("done".into())
            }
        }

        let (manager, queue) = manager_with(
            Arc::new(Tracking { active: active.clone(), max_seen: max_seen.clone() }),
            WorkerConfig { max_concurrent_workers: 2, worker_timeout_secs: 600 },
        );
        for i in 0..6 {
            let task = queue.enqueue(format!("task-{i}")).await;
            manager.spawn(task.id.clone()).await;
        }
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);

        let all = queue.list().await;
        assert!(all.iter().all(|t| t.status == TaskStatus::Complete));
    }

    #[tokio::test]
    async fn shutdown_cancels_and_awaits_all_workers() {
        let (manager, queue) = manager_with(Arc::new(WaitsForCancel), WorkerConfig::default());
        for i in 0..3 {
            let task = queue.enqueue(format!("t{i}")).await;
            manager.spawn(task.id.clone()).await;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        manager.shutdown().await;
        assert_eq!(manager.active_count().await, 0);
        let all = queue.list().await;
        assert!(all.iter().all(|t| t.status == TaskStatus::Failed));
    }
}
