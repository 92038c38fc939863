use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::messages::ServerToWorker;
use crate::model::{
    AuthenticatedEnvironment, BackgroundTask, BackgroundWorker, QueueMessage, TaskQueue, TaskRun,
    TaskRunAttempt,
};

/// Per-environment logical queue with visibility timeouts.
///
/// Implementations must never make two messages for the same run visible at
/// the same time; attempt-number monotonicity leans on that.
#[async_trait]
pub trait RunQueue: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        message_id: Uuid,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Dequeue the next visible message, hiding it for the implementation's
    /// visibility timeout.
    async fn receive(&self, queue: &str) -> anyhow::Result<Option<QueueMessage>>;

    /// Remove the message permanently.
    async fn ack(&self, message_id: Uuid) -> anyhow::Result<()>;

    /// Return the message to visibility, either immediately or at a future
    /// timestamp.
    async fn nack(&self, message_id: Uuid, visible_at: Option<DateTime<Utc>>) -> anyhow::Result<()>;

    /// Extend the in-flight message's visibility timeout.
    async fn heartbeat(&self, message_id: Uuid, extend: Duration) -> anyhow::Result<()>;
}

/// Result of the atomic run-lock update: the locked run plus the last attempt
/// number and the run's tags, fetched in the same read.
#[derive(Debug, Clone)]
pub struct LockedRun {
    pub run: TaskRun,
    pub last_attempt_number: i32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub friendly_id: String,
    pub run_id: Uuid,
    pub number: i32,
    pub started_at: DateTime<Utc>,
    pub queue_id: Uuid,
    pub background_worker_id: Uuid,
    pub background_worker_task_id: Uuid,
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Completed {
        output: Option<String>,
        output_type: Option<String>,
    },
    Failed {
        error: String,
    },
}

/// Relational store of runs, attempts, workers, queues and tags.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn find_worker_by_friendly_id(
        &self,
        environment_id: Uuid,
        friendly_id: &str,
    ) -> anyhow::Result<Option<BackgroundWorker>>;

    async fn find_run(&self, run_id: Uuid) -> anyhow::Result<Option<TaskRun>>;

    /// Set `locked_at` / `locked_by_task_id` on the run — guarded by
    /// `locked_at` being clear — and fetch the last attempt number and tags in
    /// the same transaction. Errors if the run row is gone or the lock is
    /// already held.
    async fn lock_run(
        &self,
        run_id: Uuid,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
    ) -> anyhow::Result<LockedRun>;

    async fn find_queue(
        &self,
        environment_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<TaskQueue>>;

    async fn create_attempt(&self, attempt: NewAttempt) -> anyhow::Result<TaskRunAttempt>;

    /// Transactionally clear the lock held by `locked_by_task_id` and, when
    /// given, delete the attempt created by the same iteration. A rollback
    /// arriving after the lock has moved on must not clear the new holder's
    /// lock.
    async fn rollback_execution(
        &self,
        run_id: Uuid,
        locked_by_task_id: Uuid,
        attempt_id: Option<Uuid>,
    ) -> anyhow::Result<()>;

    async fn find_attempt_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> anyhow::Result<Option<TaskRunAttempt>>;

    /// Mark the attempt completed or failed and release the run lock held by
    /// the attempt's task in the same transaction.
    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<TaskRunAttempt>;

    async fn find_task(&self, task_id: Uuid) -> anyhow::Result<Option<BackgroundTask>>;
}

/// Opaque handle to an open dispatch span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanHandle {
    pub id: Uuid,
}

/// A retry-delay event linked to a run's stored trace context.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDelayEvent {
    pub message: String,
    pub end_time: DateTime<Utc>,
    pub icon: String,
    /// Deterministic 8-byte span id, hex encoded. Stable across duplicate
    /// deliveries of the same completion.
    pub span_id: String,
}

/// Span and event recording for dispatch observability.
#[async_trait]
pub trait TraceRecorder: Send + Sync {
    /// Open a consumer-kind span carrying the tenant attributes.
    fn start_dispatch_span(&self, environment: &AuthenticatedEnvironment) -> SpanHandle;

    /// End the span, annotated with the window's success/failure counters.
    fn end_dispatch_span(&self, span: &SpanHandle, successes: u64, failures: u64);

    fn record_exception(&self, span: &SpanHandle, message: &str);

    async fn record_retry_event(&self, run: &TaskRun, event: &RetryDelayEvent)
        -> anyhow::Result<()>;
}

/// Outbound half of the websocket connection to the remote worker.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn send(&self, message: ServerToWorker) -> anyhow::Result<()>;
}
