// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process execution backend.
//!
//! Jobs run as tokio tasks that make a broker RPC call. A semaphore bounds how
//! many calls are in flight; jobs beyond the limit stay pending until a permit
//! frees up.
//!
//! A task stays in memory until its terminal record is stored. The write is
//! attempted [`STORE_ATTEMPTS`] times when the task finishes and once more
//! in a final round at shutdown, so the map holds at most the pending tasks
//! plus those whose record the store keeps refusing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker as JoinTracker;
use tracing::{debug, error, info, warn};

use crate::persistence::{TaskRecord, TaskStore};
use crate::rpc::RpcClient;

use super::{ExecutionBackend, Job, TaskError, TaskFailure, TaskId, TaskState, TaskStatus};

/// Attempts per round of writing a terminal record.
pub const STORE_ATTEMPTS: u32 = 3;

/// Delay before the first retry of a failed terminal write; doubles per retry.
const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct PoolInner {
    rpc: Arc<RpcClient>,
    store: Arc<dyn TaskStore>,
    work_queue: String,
    timeout: Duration,
    /// Tasks not yet durably recorded.
    tasks: DashMap<TaskId, TaskState>,
    permits: Arc<Semaphore>,
}

/// Executes jobs as RPC calls on a bounded pool of tokio tasks.
pub struct WorkerPoolBackend {
    inner: Arc<PoolInner>,
    workers: JoinTracker,
}

impl WorkerPoolBackend {
    pub fn new(
        rpc: Arc<RpcClient>,
        store: Arc<dyn TaskStore>,
        work_queue: impl Into<String>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                rpc,
                store,
                work_queue: work_queue.into(),
                timeout,
                tasks: DashMap::new(),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            }),
            workers: JoinTracker::new(),
        }
    }

    /// Jobs submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Finished tasks whose terminal record is not stored yet.
    pub fn unrecorded(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| entry.status.is_terminal())
            .count()
    }

    /// Stop accepting jobs and wait up to `grace` for running ones.
    ///
    /// Jobs still queued for a permit are not started; they fail with
    /// `CANCELLED`. Terminal records that could not be stored earlier get one
    /// more round of writes. Returns false if jobs were still running when the
    /// grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.workers.close();
        self.inner.permits.close();
        let remaining = self.workers.len();
        if remaining > 0 {
            info!(remaining, "Waiting for background tasks to finish");
        }
        let finished = match tokio::time::timeout(grace, self.workers.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.workers.len(),
                    "Background tasks still running after grace period"
                );
                false
            }
        };
        self.inner.flush_unrecorded().await;
        finished
    }
}

impl PoolInner {
    async fn execute(&self, task_id: TaskId, job: Job) {
        let status = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => {
                debug!(%task_id, task_kind = %job.task_kind, "Background task started");
                match self
                    .rpc
                    .call(&self.work_queue, &job.task_kind, job.payload, self.timeout)
                    .await
                {
                    Ok(outcome) => TaskStatus::Succeeded { outcome },
                    Err(e) => TaskStatus::Failed {
                        error: TaskFailure::from(&e),
                    },
                }
            }
            Err(_) => TaskStatus::Failed {
                error: TaskFailure {
                    code: "CANCELLED".to_string(),
                    message: "executor shut down before the task started".to_string(),
                },
            },
        };
        self.complete(task_id, status).await;
    }

    async fn complete(&self, task_id: TaskId, status: TaskStatus) {
        let record = {
            let Some(mut state) = self.tasks.get_mut(&task_id) else {
                warn!(%task_id, "Completed task is not tracked");
                return;
            };
            if let Err(e) = state.finish(status) {
                warn!(%task_id, error = %e, "Ignoring second terminal status");
                return;
            }
            info!(%task_id, status = state.status.name(), "Background task finished");
            state.to_record()
        };

        match record {
            Ok(record) => self.store_record(task_id, &record).await,
            Err(e) => error!(%task_id, error = %e, "Failed to encode task record"),
        }
    }

    /// Write a terminal record, retrying with backoff. The task leaves memory
    /// once the store holds a record for it; until then it stays queryable
    /// from memory.
    async fn store_record(&self, task_id: TaskId, record: &TaskRecord) {
        let mut backoff = STORE_RETRY_BACKOFF;
        for attempt in 1..=STORE_ATTEMPTS {
            match self.store.record_terminal(record).await {
                Ok(true) => {
                    self.tasks.remove(&task_id);
                    return;
                }
                Ok(false) => {
                    warn!(%task_id, "Task record already stored, keeping the first");
                    self.tasks.remove(&task_id);
                    return;
                }
                Err(e) if attempt < STORE_ATTEMPTS => {
                    warn!(%task_id, attempt, error = %e, "Failed to store task record, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        %task_id,
                        attempts = STORE_ATTEMPTS,
                        error = %e,
                        "Failed to store task record, keeping it in memory"
                    );
                }
            }
        }
    }

    async fn flush_unrecorded(&self) {
        let records: Vec<(TaskId, TaskRecord)> = self
            .tasks
            .iter()
            .filter(|entry| entry.status.is_terminal())
            .filter_map(|entry| entry.to_record().ok().map(|record| (entry.task_id, record)))
            .collect();
        if records.is_empty() {
            return;
        }

        info!(count = records.len(), "Storing task records left over from failed writes");
        for (task_id, record) in records {
            self.store_record(task_id, &record).await;
        }
        let left = self
            .tasks
            .iter()
            .filter(|entry| entry.status.is_terminal())
            .count();
        if left > 0 {
            error!(count = left, "Task records lost at shutdown");
        }
    }
}

#[async_trait]
impl ExecutionBackend for WorkerPoolBackend {
    async fn submit(&self, job: Job) -> Result<TaskId, TaskError> {
        if self.workers.is_closed() {
            return Err(TaskError::Closed);
        }

        let state = TaskState::pending(job.clone());
        let task_id = state.task_id;
        self.inner.tasks.insert(task_id, state);

        let inner = self.inner.clone();
        self.workers
            .spawn(async move { inner.execute(task_id, job).await });

        debug!(%task_id, "Background task submitted");
        Ok(task_id)
    }

    async fn status(&self, task_id: &TaskId) -> Result<TaskStatus, TaskError> {
        if let Some(state) = self.inner.tasks.get(task_id) {
            return Ok(state.status.clone());
        }

        match self.inner.store.get_task(&task_id.to_string()).await? {
            Some(record) => Ok(TaskStatus::try_from(&record)?),
            None => Err(TaskError::NotFound(*task_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dispatch_broker::{Broker, MemoryBroker};
    use serde_json::json;
    use tokio::sync::watch;

    use crate::consumer::WorkConsumer;
    use crate::dead_letter::DeadLetterPolicy;
    use crate::error::CoreError;
    use crate::persistence::{SqliteTaskStore, TaskLogRecord};
    use crate::tasks::TaskTracker;
    use crate::transform::TransformRegistry;

    /// A SQLite store whose terminal writes can be held back or made to fail.
    struct ControlledStore {
        inner: Arc<SqliteTaskStore>,
        gate: Semaphore,
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl ControlledStore {
        async fn new(open: bool, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: Arc::new(SqliteTaskStore::connect("sqlite::memory:").await.unwrap()),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                failures: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
            })
        }

        fn open_gate(&self) {
            self.gate.add_permits(1);
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskStore for ControlledStore {
        async fn record_terminal(&self, record: &TaskRecord) -> Result<bool, CoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let _pass = self.gate.acquire().await.unwrap();
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "database is locked".to_string(),
                });
            }
            self.inner.record_terminal(record).await
        }

        async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
            self.inner.get_task(task_id).await
        }

        async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<TaskRecord>, CoreError> {
            self.inner.list_tasks(limit, offset).await
        }

        async fn append_log(&self, entry: &TaskLogRecord) -> Result<(), CoreError> {
            self.inner.append_log(entry).await
        }

        async fn logs_for_correlation(
            &self,
            correlation_id: &str,
        ) -> Result<Vec<TaskLogRecord>, CoreError> {
            self.inner.logs_for_correlation(correlation_id).await
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            self.inner.health_check().await
        }
    }

    struct Harness {
        broker: MemoryBroker,
        store: Arc<SqliteTaskStore>,
        backend: Arc<WorkerPoolBackend>,
        tracker: TaskTracker,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness(consumers: usize, timeout: Duration) -> Harness {
        let store = Arc::new(SqliteTaskStore::connect("sqlite::memory:").await.unwrap());
        harness_with(consumers, timeout, 4, store.clone(), store).await
    }

    /// `backend_store` is what the pool writes through; `store` is read back
    /// directly by assertions.
    async fn harness_with(
        consumers: usize,
        timeout: Duration,
        max_concurrent: usize,
        store: Arc<SqliteTaskStore>,
        backend_store: Arc<dyn TaskStore>,
    ) -> Harness {
        let broker = MemoryBroker::new();
        DeadLetterPolicy::default()
            .declare(&broker, "work")
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = WorkConsumer::new(
            Arc::new(broker.clone()),
            "work",
            Arc::new(TransformRegistry::with_builtins()),
        );
        crate::consumer::start_consumers(&consumer, consumers, &shutdown_rx)
            .await
            .unwrap();

        let rpc = Arc::new(RpcClient::new(Arc::new(broker.clone())));
        let backend = Arc::new(WorkerPoolBackend::new(
            rpc,
            backend_store,
            "work",
            timeout,
            max_concurrent,
        ));
        Harness {
            broker,
            store,
            tracker: TaskTracker::new(backend.clone()),
            backend,
            _shutdown: shutdown_tx,
        }
    }

    async fn wait_terminal(tracker: &TaskTracker, task_id: &TaskId) -> TaskStatus {
        for _ in 0..500 {
            let status = tracker.status(task_id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not finish");
    }

    #[tokio::test]
    async fn test_submitted_task_succeeds_and_is_recorded() {
        let h = harness(1, Duration::from_secs(5)).await;

        let task_id = h.tracker.submit(json!(21), "double").await.unwrap();
        let status = wait_terminal(&h.tracker, &task_id).await;
        assert_eq!(status, TaskStatus::Succeeded { outcome: json!(42) });

        assert!(h.backend.shutdown(Duration::from_secs(1)).await);
        let record = h
            .store
            .get_task(&task_id.to_string())
            .await
            .unwrap()
            .expect("terminal record stored");
        assert_eq!(record.status, "succeeded");
        assert_eq!(record.task_kind, "double");
        assert_eq!(h.backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_marks_task_failed() {
        let h = harness(1, Duration::from_secs(5)).await;

        let task_id = h.tracker.submit(json!(3), "uppercase").await.unwrap();
        match wait_terminal(&h.tracker, &task_id).await {
            TaskStatus::Failed { error } => assert_eq!(error.code, "INVALID_INPUT"),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_consumer_marks_task_failed() {
        let h = harness(0, Duration::from_secs(5)).await;

        let task_id = h.tracker.submit(json!("x"), "data").await.unwrap();
        match wait_terminal(&h.tracker, &task_id).await {
            TaskStatus::Failed { error } => assert_eq!(error.code, "NO_SUBSCRIBER"),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(h.broker.message_count("work").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_is_pending_until_reply() {
        let h = harness(0, Duration::from_secs(5)).await;
        // A subscriber that never answers keeps the call pending.
        let _silent = h.broker.consume("work").await.unwrap();

        let task_id = h.tracker.submit(json!("x"), "data").await.unwrap();
        assert_eq!(h.tracker.status(&task_id).await.unwrap(), TaskStatus::Pending);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.tracker.status(&task_id).await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let h = harness(1, Duration::from_secs(5)).await;
        let unknown = TaskId::new();
        assert!(matches!(
            h.tracker.status(&unknown).await,
            Err(TaskError::NotFound(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_submissions() {
        let h = harness(1, Duration::from_secs(5)).await;
        assert!(h.backend.shutdown(Duration::from_millis(10)).await);
        assert!(matches!(
            h.tracker.submit(json!(1), "double").await,
            Err(TaskError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_many_tasks_complete_independently() {
        let h = harness(2, Duration::from_secs(5)).await;

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push((i, h.tracker.submit(json!(i), "square").await.unwrap()));
        }
        for (i, task_id) in ids {
            assert_eq!(
                wait_terminal(&h.tracker, &task_id).await,
                TaskStatus::Succeeded {
                    outcome: json!(i * i)
                }
            );
        }
        assert_eq!(h.store.list_tasks(100, 0).await.unwrap().len(), 20);
    }

    async fn wait_recorded(h: &Harness, task_id: &TaskId) -> TaskRecord {
        for _ in 0..500 {
            if h.backend.inner.tasks.is_empty()
                && let Some(record) = h.store.get_task(&task_id.to_string()).await.unwrap()
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record for {task_id} never landed");
    }

    #[tokio::test]
    async fn test_status_is_identical_before_and_after_record_lands() {
        let cases = [
            (json!(1.1), "square"),
            (
                json!({"name": "widget", "price": 19.99, "ratio": 0.1, "tags": ["b", "a"]}),
                "data",
            ),
        ];
        for (payload, kind) in cases {
            let store = ControlledStore::new(false, 0).await;
            let h = harness_with(1, Duration::from_secs(5), 4, store.inner.clone(), store.clone())
                .await;

            let task_id = h.tracker.submit(payload, kind).await.unwrap();
            let from_memory = wait_terminal(&h.tracker, &task_id).await;
            assert!(matches!(from_memory, TaskStatus::Succeeded { .. }));

            // The write is held back, so these reads are served from memory.
            for _ in 0..3 {
                assert_eq!(h.tracker.status(&task_id).await.unwrap(), from_memory);
                tokio::task::yield_now().await;
            }
            assert!(h.store.get_task(&task_id.to_string()).await.unwrap().is_none());

            store.open_gate();
            wait_recorded(&h, &task_id).await;

            // Now served from the store.
            for _ in 0..3 {
                assert_eq!(h.tracker.status(&task_id).await.unwrap(), from_memory);
            }
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_is_retried() {
        let store = ControlledStore::new(true, STORE_ATTEMPTS as usize - 1).await;
        let h = harness_with(1, Duration::from_secs(5), 4, store.inner.clone(), store.clone()).await;

        let task_id = h.tracker.submit(json!(4), "double").await.unwrap();
        let record = wait_recorded(&h, &task_id).await;

        assert_eq!(record.status, "succeeded");
        assert_eq!(store.attempts(), STORE_ATTEMPTS as usize);
        assert_eq!(h.backend.unrecorded(), 0);
        assert_eq!(
            h.tracker.status(&task_id).await.unwrap(),
            TaskStatus::Succeeded { outcome: json!(8) }
        );
    }

    #[tokio::test]
    async fn test_unstored_record_is_kept_and_flushed_at_shutdown() {
        let store = ControlledStore::new(true, STORE_ATTEMPTS as usize + 1).await;
        let h = harness_with(1, Duration::from_secs(5), 4, store.inner.clone(), store.clone()).await;

        let task_id = h.tracker.submit(json!("abc"), "reverse").await.unwrap();
        wait_terminal(&h.tracker, &task_id).await;
        for _ in 0..500 {
            if store.attempts() == STORE_ATTEMPTS as usize && h.backend.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Every attempt of the first round failed; the status is still served.
        assert_eq!(h.backend.unrecorded(), 1);
        assert!(h.store.get_task(&task_id.to_string()).await.unwrap().is_none());
        assert_eq!(
            h.tracker.status(&task_id).await.unwrap(),
            TaskStatus::Succeeded {
                outcome: json!("cba")
            }
        );

        assert!(h.backend.shutdown(Duration::from_secs(1)).await);
        assert_eq!(h.backend.unrecorded(), 0);
        assert_eq!(store.attempts(), STORE_ATTEMPTS as usize + 2);
        let record = h.store.get_task(&task_id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.outcome.as_deref(), Some("\"cba\""));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_jobs_waiting_for_a_permit() {
        let store = Arc::new(SqliteTaskStore::connect("sqlite::memory:").await.unwrap());
        let h = harness_with(0, Duration::from_secs(5), 1, store.clone(), store).await;
        // Holds the only running call without replying.
        let _silent = h.broker.consume("work").await.unwrap();

        let running = h.tracker.submit(json!(1), "double").await.unwrap();
        let queued = h.tracker.submit(json!(2), "double").await.unwrap();
        for _ in 0..500 {
            if h.broker.unacked_count("work") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.broker.unacked_count("work"), 1);

        // The running call outlives the grace period.
        assert!(!h.backend.shutdown(Duration::from_millis(50)).await);

        match wait_terminal(&h.tracker, &queued).await {
            TaskStatus::Failed { error } => assert_eq!(error.code, "CANCELLED"),
            other => panic!("unexpected status: {other:?}"),
        }
        let mut record = None;
        for _ in 0..500 {
            record = h.store.get_task(&queued.to_string()).await.unwrap();
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = record.expect("cancelled task recorded");
        assert_eq!(record.error_code.as_deref(), Some("CANCELLED"));

        assert_eq!(h.tracker.status(&running).await.unwrap(), TaskStatus::Pending);
        // Only the running call ever reached the broker.
        assert_eq!(h.broker.message_count("work").await.unwrap(), 0);
    }
}
