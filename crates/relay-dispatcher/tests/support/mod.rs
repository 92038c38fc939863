//! In-memory implementations of the dispatcher contracts, plus fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use relay_core::contracts::{
    AttemptOutcome, LockedRun, NewAttempt, RetryDelayEvent, RunQueue, RunStore, SpanHandle,
    TraceRecorder, WorkerTransport,
};
use relay_core::messages::{ExecutePayload, ServerEvent, ServerToWorker};
use relay_core::model::{
    AttemptStatus, AuthenticatedEnvironment, BackgroundTask, BackgroundWorker, EnvironmentKind,
    Organization, Project, QueueMessage, TaskQueue, TaskRetryConfig, TaskRun, TaskRunAttempt,
};
use relay_dispatcher::{Dispatcher, DispatcherOptions};

const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_DEADLINE: Duration = Duration::from_secs(5);
const WAIT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub enum QueueAction {
    Ack(Uuid),
    Nack(Uuid, Option<DateTime<Utc>>),
    Heartbeat(Uuid, Duration),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: Uuid,
    queue_name: String,
    payload: Value,
    deliveries: i32,
    visible_at: DateTime<Utc>,
}

/// Single-consumer queue with visibility timeouts and an action log.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<StoredMessage>>,
    actions: Mutex<Vec<QueueAction>>,
}

impl MemoryQueue {
    pub async fn actions(&self) -> Vec<QueueAction> {
        self.actions.lock().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    pub async fn visible_at(&self, message_id: Uuid) -> Option<DateTime<Utc>> {
        self.messages
            .lock()
            .await
            .iter()
            .find(|m| m.message_id == message_id)
            .map(|m| m.visible_at)
    }
}

#[async_trait]
impl RunQueue for MemoryQueue {
    async fn publish(
        &self,
        queue: &str,
        message_id: Uuid,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.messages.lock().await.push(StoredMessage {
            message_id,
            queue_name: queue.to_string(),
            payload,
            deliveries: 0,
            visible_at: available_at,
        });
        Ok(())
    }

    async fn receive(&self, queue: &str) -> anyhow::Result<Option<QueueMessage>> {
        let now = Utc::now();
        let mut messages = self.messages.lock().await;
        let Some(message) = messages
            .iter_mut()
            .find(|m| m.queue_name == queue && m.visible_at <= now)
        else {
            return Ok(None);
        };

        message.visible_at = now + chrono::Duration::from_std(VISIBILITY_TIMEOUT)?;
        message.deliveries += 1;
        Ok(Some(QueueMessage {
            message_id: message.message_id,
            queue_name: message.queue_name.clone(),
            payload: message.payload.clone(),
            deliveries: message.deliveries,
        }))
    }

    async fn ack(&self, message_id: Uuid) -> anyhow::Result<()> {
        self.messages
            .lock()
            .await
            .retain(|m| m.message_id != message_id);
        self.actions.lock().await.push(QueueAction::Ack(message_id));
        Ok(())
    }

    async fn nack(
        &self,
        message_id: Uuid,
        visible_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(message) = messages.iter_mut().find(|m| m.message_id == message_id) {
            message.visible_at = visible_at.unwrap_or_else(Utc::now);
        }
        self.actions
            .lock()
            .await
            .push(QueueAction::Nack(message_id, visible_at));
        Ok(())
    }

    async fn heartbeat(&self, message_id: Uuid, extend: Duration) -> anyhow::Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(message) = messages.iter_mut().find(|m| m.message_id == message_id) {
            message.visible_at = Utc::now() + chrono::Duration::from_std(extend)?;
        }
        self.actions
            .lock()
            .await
            .push(QueueAction::Heartbeat(message_id, extend));
        Ok(())
    }
}

/// Two-phase gate: the store parks inside an operation until the test releases
/// it, letting tests interleave `stop()` with a precise point of an iteration.
#[derive(Clone)]
pub struct StepGate {
    reached: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

impl StepGate {
    pub fn new() -> Self {
        Self {
            reached: Arc::new(Semaphore::new(0)),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    pub async fn wait_reached(&self) {
        self.reached.acquire().await.unwrap().forget();
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.reached.add_permits(1);
        self.release.acquire().await.unwrap().forget();
    }
}

#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<Uuid, TaskRun>>,
    tags: Mutex<HashMap<Uuid, Vec<String>>>,
    attempts: Mutex<Vec<TaskRunAttempt>>,
    workers: Mutex<Vec<BackgroundWorker>>,
    queues: Mutex<Vec<TaskQueue>>,
    queue_lookup_gate: Mutex<Option<StepGate>>,
}

impl MemoryStore {
    pub async fn insert_worker(&self, worker: BackgroundWorker) {
        self.workers.lock().await.push(worker);
    }

    pub async fn insert_run(&self, run: TaskRun, tags: Vec<String>) {
        self.tags.lock().await.insert(run.id, tags);
        self.runs.lock().await.insert(run.id, run);
    }

    pub async fn insert_queue(&self, queue: TaskQueue) {
        self.queues.lock().await.push(queue);
    }

    pub async fn set_queue_lookup_gate(&self, gate: StepGate) {
        *self.queue_lookup_gate.lock().await = Some(gate);
    }

    pub async fn run(&self, run_id: Uuid) -> Option<TaskRun> {
        self.runs.lock().await.get(&run_id).cloned()
    }

    pub async fn attempts(&self) -> Vec<TaskRunAttempt> {
        self.attempts.lock().await.clone()
    }

    pub async fn attempts_for(&self, run_id: Uuid) -> Vec<TaskRunAttempt> {
        let mut attempts: Vec<_> = self
            .attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.number);
        attempts
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn find_worker_by_friendly_id(
        &self,
        _environment_id: Uuid,
        friendly_id: &str,
    ) -> anyhow::Result<Option<BackgroundWorker>> {
        Ok(self
            .workers
            .lock()
            .await
            .iter()
            .find(|w| w.friendly_id == friendly_id)
            .cloned())
    }

    async fn find_run(&self, run_id: Uuid) -> anyhow::Result<Option<TaskRun>> {
        Ok(self.runs.lock().await.get(&run_id).cloned())
    }

    async fn lock_run(
        &self,
        run_id: Uuid,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
    ) -> anyhow::Result<LockedRun> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
        if run.locked_at.is_some() {
            anyhow::bail!("run {run_id} already locked");
        }
        run.locked_at = Some(locked_at);
        run.locked_by_task_id = Some(task_id);
        let run = run.clone();

        let last_attempt_number = self
            .attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.run_id == run_id)
            .map(|a| a.number)
            .max()
            .unwrap_or(0);
        let tags = self
            .tags
            .lock()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default();

        Ok(LockedRun {
            run,
            last_attempt_number,
            tags,
        })
    }

    async fn find_queue(
        &self,
        environment_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<TaskQueue>> {
        let gate = self.queue_lookup_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        Ok(self
            .queues
            .lock()
            .await
            .iter()
            .find(|q| q.environment_id == environment_id && q.name == name)
            .cloned())
    }

    async fn create_attempt(&self, attempt: NewAttempt) -> anyhow::Result<TaskRunAttempt> {
        let attempt = TaskRunAttempt {
            id: Uuid::new_v4(),
            friendly_id: attempt.friendly_id,
            run_id: attempt.run_id,
            number: attempt.number,
            status: AttemptStatus::Executing,
            started_at: attempt.started_at,
            completed_at: None,
            output: None,
            output_type: None,
            error: None,
            queue_id: attempt.queue_id,
            background_worker_id: attempt.background_worker_id,
            background_worker_task_id: attempt.background_worker_task_id,
        };
        self.attempts.lock().await.push(attempt.clone());
        Ok(attempt)
    }

    async fn rollback_execution(
        &self,
        run_id: Uuid,
        locked_by_task_id: Uuid,
        attempt_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        {
            let mut runs = self.runs.lock().await;
            if let Some(run) = runs.get_mut(&run_id) {
                if run.locked_by_task_id == Some(locked_by_task_id) {
                    run.locked_at = None;
                    run.locked_by_task_id = None;
                }
            }
        }
        if let Some(attempt_id) = attempt_id {
            self.attempts.lock().await.retain(|a| a.id != attempt_id);
        }
        Ok(())
    }

    async fn find_attempt_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> anyhow::Result<Option<TaskRunAttempt>> {
        Ok(self
            .attempts
            .lock()
            .await
            .iter()
            .find(|a| a.friendly_id == friendly_id)
            .cloned())
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<TaskRunAttempt> {
        let finished = {
            let mut attempts = self.attempts.lock().await;
            let attempt = attempts
                .iter_mut()
                .find(|a| a.id == attempt_id)
                .ok_or_else(|| anyhow::anyhow!("attempt {attempt_id} not found"))?;

            match outcome {
                AttemptOutcome::Completed {
                    output,
                    output_type,
                } => {
                    attempt.status = AttemptStatus::Completed;
                    attempt.output = output;
                    attempt.output_type = output_type;
                }
                AttemptOutcome::Failed { error } => {
                    attempt.status = AttemptStatus::Failed;
                    attempt.error = Some(error);
                }
            }
            attempt.completed_at = Some(completed_at);
            attempt.clone()
        };

        // the settled attempt's task releases the run lock
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get_mut(&finished.run_id) {
            if run.locked_by_task_id == Some(finished.background_worker_task_id) {
                run.locked_at = None;
                run.locked_by_task_id = None;
            }
        }

        Ok(finished)
    }

    async fn find_task(&self, task_id: Uuid) -> anyhow::Result<Option<BackgroundTask>> {
        Ok(self
            .workers
            .lock()
            .await
            .iter()
            .flat_map(|w| w.tasks.iter())
            .find(|t| t.id == task_id)
            .cloned())
    }
}

#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub handle: SpanHandle,
    pub closed: Option<(u64, u64)>,
    pub exceptions: Vec<String>,
}

#[derive(Default)]
pub struct RecordingTracer {
    spans: std::sync::Mutex<Vec<SpanRecord>>,
    retry_events: std::sync::Mutex<Vec<(Uuid, RetryDelayEvent)>>,
}

impl RecordingTracer {
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().unwrap().clone()
    }

    pub fn retry_events(&self) -> Vec<(Uuid, RetryDelayEvent)> {
        self.retry_events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TraceRecorder for RecordingTracer {
    fn start_dispatch_span(&self, _environment: &AuthenticatedEnvironment) -> SpanHandle {
        let handle = SpanHandle { id: Uuid::new_v4() };
        self.spans.lock().unwrap().push(SpanRecord {
            handle: handle.clone(),
            closed: None,
            exceptions: Vec::new(),
        });
        handle
    }

    fn end_dispatch_span(&self, span: &SpanHandle, successes: u64, failures: u64) {
        let mut spans = self.spans.lock().unwrap();
        if let Some(record) = spans.iter_mut().find(|r| r.handle == *span) {
            record.closed = Some((successes, failures));
        }
    }

    fn record_exception(&self, span: &SpanHandle, message: &str) {
        let mut spans = self.spans.lock().unwrap();
        if let Some(record) = spans.iter_mut().find(|r| r.handle == *span) {
            record.exceptions.push(message.to_string());
        }
    }

    async fn record_retry_event(
        &self,
        run: &TaskRun,
        event: &RetryDelayEvent,
    ) -> anyhow::Result<()> {
        self.retry_events
            .lock()
            .unwrap()
            .push((run.id, event.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<ServerToWorker>>,
    fail_next: AtomicBool,
}

impl RecordingTransport {
    pub async fn sent(&self) -> Vec<ServerToWorker> {
        self.sent.lock().await.clone()
    }

    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerTransport for RecordingTransport {
    async fn send(&self, message: ServerToWorker) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("worker connection closed");
        }
        self.sent.lock().await.push(message);
        Ok(())
    }
}

pub fn environment() -> AuthenticatedEnvironment {
    AuthenticatedEnvironment {
        id: Uuid::new_v4(),
        friendly_id: "env_prod".to_string(),
        slug: "prod".to_string(),
        kind: EnvironmentKind::Production,
        organization: Organization {
            id: Uuid::new_v4(),
            friendly_id: "org_acme".to_string(),
            slug: "acme".to_string(),
            name: "Acme".to_string(),
        },
        project: Project {
            id: Uuid::new_v4(),
            friendly_id: "proj_api".to_string(),
            external_ref: "proj_ref_api".to_string(),
            slug: "api".to_string(),
            name: "API".to_string(),
        },
    }
}

pub fn task(slug: &str) -> BackgroundTask {
    BackgroundTask {
        id: Uuid::new_v4(),
        friendly_id: format!("task_{slug}"),
        slug: slug.to_string(),
        file_path: format!("src/trigger/{slug}.ts"),
        export_name: "handler".to_string(),
        retry_config: None,
    }
}

pub fn task_with_retry(slug: &str, max_attempts: u32) -> BackgroundTask {
    BackgroundTask {
        retry_config: Some(TaskRetryConfig {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }),
        ..task(slug)
    }
}

pub fn worker(friendly_id: &str, version: &str, tasks: Vec<BackgroundTask>) -> BackgroundWorker {
    BackgroundWorker {
        id: Uuid::new_v4(),
        friendly_id: friendly_id.to_string(),
        version: version.to_string(),
        tasks,
    }
}

pub fn run_for(task_identifier: &str) -> TaskRun {
    let id = Uuid::new_v4();
    TaskRun {
        id,
        friendly_id: format!("run_{}", id.simple()),
        task_identifier: task_identifier.to_string(),
        queue_name: "default".to_string(),
        payload: "{\"to\":\"user@example.com\"}".to_string(),
        payload_type: "application/json".to_string(),
        context: None,
        trace_context: json!({
            "traceparent": format!("00-{}-0000000000000001-01", id.simple()),
        }),
        created_at: Utc::now(),
        locked_at: None,
        locked_by_task_id: None,
        locked_to_version_id: None,
    }
}

pub fn fast_options() -> DispatcherOptions {
    DispatcherOptions {
        idle_delay: Duration::from_millis(20),
        dispatch_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

pub struct TestHarness {
    pub environment: AuthenticatedEnvironment,
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub tracer: Arc<RecordingTracer>,
    pub transport: Arc<RecordingTransport>,
    pub dispatcher: Dispatcher,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_options(fast_options())
    }

    pub fn with_options(options: DispatcherOptions) -> Self {
        let environment = environment();
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryStore::default());
        let tracer = Arc::new(RecordingTracer::default());
        let transport = Arc::new(RecordingTransport::default());

        let dispatcher = Dispatcher::new(
            environment.clone(),
            queue.clone(),
            store.clone(),
            tracer.clone(),
            transport.clone(),
            options,
        );

        Self {
            environment,
            queue,
            store,
            tracer,
            transport,
            dispatcher,
        }
    }

    pub async fn seed_default_queue(&self) -> TaskQueue {
        let queue = TaskQueue {
            id: Uuid::new_v4(),
            friendly_id: "queue_default".to_string(),
            name: "default".to_string(),
            environment_id: self.environment.id,
        };
        self.store.insert_queue(queue.clone()).await;
        queue
    }

    /// Insert the run row and publish its EXECUTE message on the environment
    /// queue.
    pub async fn seed_run(&self, run: &TaskRun, tags: Vec<String>) -> anyhow::Result<()> {
        self.store.insert_run(run.clone(), tags).await;
        self.queue
            .publish(
                &self.environment.queue_id(),
                run.id,
                json!({"type": "EXECUTE", "taskIdentifier": run.task_identifier}),
                Utc::now(),
            )
            .await
    }

    pub async fn wait_for_sends(&self, count: usize) -> anyhow::Result<Vec<ServerToWorker>> {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        loop {
            let sent = self.transport.sent().await;
            if sent.len() >= count {
                return Ok(sent);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timed out waiting for {count} sends, got {}", sent.len());
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    pub async fn wait_for_action<F>(&self, matches: F) -> anyhow::Result<QueueAction>
    where
        F: Fn(&QueueAction) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        loop {
            if let Some(action) = self.queue.actions().await.into_iter().find(|a| matches(a)) {
                return Ok(action);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timed out waiting for queue action");
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }
}

/// Pull the EXECUTE_RUNS payloads out of an outbound frame.
pub fn execute_payloads(message: &ServerToWorker) -> Vec<ExecutePayload> {
    match message {
        ServerToWorker::BackgroundWorkerMessage {
            data: ServerEvent::ExecuteRuns { payloads },
            ..
        } => payloads.clone(),
        other => panic!("expected EXECUTE_RUNS frame, got {other:?}"),
    }
}

/// The friendly worker id an outbound frame is addressed to.
pub fn frame_worker_id(message: &ServerToWorker) -> &str {
    match message {
        ServerToWorker::BackgroundWorkerMessage {
            background_worker_id,
            ..
        } => background_worker_id,
        other => panic!("expected BACKGROUND_WORKER_MESSAGE frame, got {other:?}"),
    }
}
