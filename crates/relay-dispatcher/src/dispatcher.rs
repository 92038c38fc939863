//! The per-connection pull-dispatch cycle.
//!
//! The loop is a single tokio task: exactly one iteration is in flight, and
//! the next one is scheduled by a timed resumption only after the previous
//! completes. Every exit path of an iteration either resumes the loop or
//! stops it cleanly; the loop itself never returns an error.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use relay_core::contracts::{
    LockedRun, NewAttempt, RunQueue, RunStore, TraceRecorder, WorkerTransport,
};
use relay_core::execution::{
    ExecutionAttempt, ExecutionEnvironment, ExecutionOrganization, ExecutionProject,
    ExecutionQueue, ExecutionRun, ExecutionTask, TaskRunExecution,
};
use relay_core::ids;
use relay_core::messages::{ExecutePayload, RunMessageBody, ServerEvent, ServerToWorker};
use relay_core::model::{
    AttemptStatus, AuthenticatedEnvironment, BackgroundTask, BackgroundWorker, TaskQueue, TaskRun,
};

use crate::registry::WorkerRegistry;
use crate::window::{TraceWindow, TraceWindowConfig};

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Bound on dispatch iterations grouped under one tracing span.
    pub maximum_items_per_trace: u32,
    /// Wall-clock bound per tracing span.
    pub trace_timeout: Duration,
    /// Resumption delay after an empty dequeue.
    pub idle_delay: Duration,
    /// Resumption delay after any non-idle iteration.
    pub dispatch_delay: Duration,
    /// Visibility extension applied per heartbeat.
    pub heartbeat_extension: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            maximum_items_per_trace: 1_000,
            trace_timeout: Duration::from_secs(60),
            idle_delay: Duration::from_millis(1_000),
            dispatch_delay: Duration::from_millis(100),
            heartbeat_extension: Duration::from_secs(60),
        }
    }
}

/// What a finished iteration asks of the loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Resume(Duration),
    Stop,
}

#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) environment: AuthenticatedEnvironment,
    pub(crate) queue: Arc<dyn RunQueue>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) tracer: Arc<dyn TraceRecorder>,
    pub(crate) transport: Arc<dyn WorkerTransport>,
    pub(crate) options: DispatcherOptions,
    pub(crate) registry: Mutex<WorkerRegistry>,
    pub(crate) window: Mutex<TraceWindow>,
    pub(crate) enabled: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        environment: AuthenticatedEnvironment,
        queue: Arc<dyn RunQueue>,
        store: Arc<dyn RunStore>,
        tracer: Arc<dyn TraceRecorder>,
        transport: Arc<dyn WorkerTransport>,
        options: DispatcherOptions,
    ) -> Self {
        let window = TraceWindow::new(TraceWindowConfig {
            max_items: options.maximum_items_per_trace,
            timeout: options.trace_timeout,
        });

        Self {
            inner: Arc::new(Inner {
                environment,
                queue,
                store,
                tracer,
                transport,
                options,
                registry: Mutex::new(WorkerRegistry::default()),
                window: Mutex::new(window),
                enabled: AtomicBool::new(false),
                loop_task: Mutex::new(None),
            }),
        }
    }

    pub fn environment(&self) -> &AuthenticatedEnvironment {
        &self.inner.environment
    }

    /// Handle `READY_FOR_TASKS`: fetch the worker and its tasks scoped by the
    /// environment, store it by id, and enable the dispatch loop if idle. An
    /// unknown worker id is a no-op.
    pub async fn register_worker(&self, friendly_worker_id: &str) -> anyhow::Result<()> {
        let worker = self
            .inner
            .store
            .find_worker_by_friendly_id(self.inner.environment.id, friendly_worker_id)
            .await?;

        let Some(worker) = worker else {
            tracing::debug!(
                event = "relay.dispatcher.register.unknown_worker",
                environment = %self.inner.environment.friendly_id,
                worker = friendly_worker_id,
                "ignoring READY_FOR_TASKS for unknown worker"
            );
            return Ok(());
        };

        tracing::info!(
            event = "relay.dispatcher.register",
            environment = %self.inner.environment.friendly_id,
            worker = %worker.friendly_id,
            version = %worker.version,
            tasks = worker.tasks.len(),
            "registered background worker"
        );

        self.inner.registry.lock().await.insert(worker);
        self.start_if_idle().await;
        Ok(())
    }

    async fn start_if_idle(&self) {
        let mut slot = self.inner.loop_task.lock().await;
        self.inner.enabled.store(true, Ordering::SeqCst);

        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            run_loop(inner).await;
        }));
    }

    /// Disable the loop. The in-flight iteration completes; if it reaches the
    /// post-lock abort check it nacks its message and returns. In-flight
    /// completion handlers keep running and close out their attempts.
    pub async fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);

        let mut window = self.inner.window.lock().await;
        if let Some((span, successes, failures)) = window.close() {
            self.inner.tracer.end_dispatch_span(&span, successes, failures);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Run a single dispatch iteration. The loop task drives this; it is
    /// public so callers can step the dispatcher deterministically.
    pub async fn tick_once(&self) -> Tick {
        self.inner.tick().await
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if !inner.enabled.load(Ordering::SeqCst) {
            let mut slot = inner.loop_task.lock().await;
            if inner.enabled.load(Ordering::SeqCst) {
                // re-enabled while parking; keep going on this task
                continue;
            }
            slot.take();
            return;
        }

        match inner.tick().await {
            Tick::Resume(delay) => tokio::time::sleep(delay).await,
            Tick::Stop => {
                let mut slot = inner.loop_task.lock().await;
                slot.take();
                return;
            }
        }
    }
}

impl Inner {
    async fn tick(&self) -> Tick {
        self.roll_window_if_due().await;

        let queue_id = self.environment.queue_id();
        let message = match self.queue.receive(&queue_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return Tick::Resume(self.options.idle_delay),
            Err(err) => {
                tracing::warn!(
                    event = "relay.dispatcher.dequeue.error",
                    queue = %queue_id,
                    error = %err,
                    "dequeue failed"
                );
                return Tick::Resume(self.options.idle_delay);
            }
        };
        let message_id = message.message_id;

        let body: RunMessageBody = match serde_json::from_value(message.payload.clone()) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(
                    event = "relay.dispatcher.message.unparseable",
                    message_id = %message_id,
                    error = %err,
                    "dropping unparseable queue message"
                );
                self.ack(message_id).await;
                return Tick::Resume(self.options.dispatch_delay);
            }
        };
        let RunMessageBody::Execute { task_identifier } = body;

        let run = match self.store.find_run(message_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(
                    event = "relay.dispatcher.run.missing",
                    message_id = %message_id,
                    "no run row for queue message; dropping"
                );
                self.ack(message_id).await;
                return Tick::Resume(self.options.dispatch_delay);
            }
            Err(err) => {
                tracing::error!(
                    event = "relay.dispatcher.run.lookup_failed",
                    message_id = %message_id,
                    error = %err,
                    "run lookup failed; dropping message"
                );
                self.ack(message_id).await;
                return Tick::Resume(self.options.dispatch_delay);
            }
        };

        // Pinned runs must execute against their exact bundle; unpinned runs
        // take the newest registered version.
        let worker = {
            let registry = self.registry.lock().await;
            match run.locked_to_version_id {
                Some(version_id) => registry.get(version_id).cloned(),
                None => registry.latest().cloned(),
            }
        };
        let Some(worker) = worker else {
            tracing::debug!(
                event = "relay.dispatcher.no_worker_version",
                run = %run.friendly_id,
                pinned = run.locked_to_version_id.is_some(),
                "no registered worker version can handle this run; dropping"
            );
            self.ack(message_id).await;
            return Tick::Resume(self.options.dispatch_delay);
        };

        let Some(task) = worker.task_by_slug(&task_identifier).cloned() else {
            tracing::warn!(
                event = "relay.dispatcher.no_matching_task",
                run = %run.friendly_id,
                task = %task_identifier,
                worker = %worker.friendly_id,
                version = %worker.version,
                "worker has no task for identifier; dropping"
            );
            self.ack(message_id).await;
            return Tick::Resume(self.options.dispatch_delay);
        };

        let now = Utc::now();
        let locked = match self.store.lock_run(run.id, task.id, now).await {
            Ok(locked) => locked,
            Err(err) => {
                tracing::error!(
                    event = "relay.dispatcher.lock_failed",
                    run = %run.friendly_id,
                    error = %err,
                    "failed to lock run; dropping message"
                );
                self.ack(message_id).await;
                return Tick::Resume(self.options.dispatch_delay);
            }
        };

        let task_queue = match self
            .store
            .find_queue(self.environment.id, &locked.run.queue_name)
            .await
        {
            Ok(Some(queue)) => queue,
            Ok(None) => {
                tracing::warn!(
                    event = "relay.dispatcher.queue_row.missing",
                    run = %locked.run.friendly_id,
                    queue_name = %locked.run.queue_name,
                    "queue row missing; returning message for redelivery"
                );
                self.rollback(&locked.run, task.id, None).await;
                self.nack(message_id, None).await;
                return Tick::Resume(self.options.idle_delay);
            }
            Err(err) => {
                tracing::warn!(
                    event = "relay.dispatcher.queue_row.lookup_failed",
                    run = %locked.run.friendly_id,
                    error = %err,
                    "queue row lookup failed; returning message for redelivery"
                );
                self.rollback(&locked.run, task.id, None).await;
                self.nack(message_id, None).await;
                return Tick::Resume(self.options.idle_delay);
            }
        };

        // stop() may have landed since the dequeue; the lock is released so a
        // redelivery can be claimed elsewhere
        if !self.enabled.load(Ordering::SeqCst) {
            self.rollback(&locked.run, task.id, None).await;
            self.nack(message_id, None).await;
            return Tick::Stop;
        }

        let attempt_number = locked.last_attempt_number + 1;
        let attempt = match self
            .store
            .create_attempt(NewAttempt {
                friendly_id: ids::friendly_id("attempt"),
                run_id: locked.run.id,
                number: attempt_number,
                started_at: now,
                queue_id: task_queue.id,
                background_worker_id: worker.id,
                background_worker_task_id: task.id,
            })
            .await
        {
            Ok(attempt) => attempt,
            Err(err) => {
                tracing::error!(
                    event = "relay.dispatcher.attempt.create_failed",
                    run = %locked.run.friendly_id,
                    error = %err,
                    "failed to create attempt; unlocking run"
                );
                self.rollback(&locked.run, task.id, None).await;
                self.nack(message_id, None).await;
                return Tick::Resume(self.options.dispatch_delay);
            }
        };

        let execution =
            build_execution(&self.environment, &worker, &task, &locked, &attempt, &task_queue);

        let outbound = ServerToWorker::BackgroundWorkerMessage {
            background_worker_id: worker.friendly_id.clone(),
            data: ServerEvent::ExecuteRuns {
                payloads: vec![ExecutePayload {
                    execution,
                    trace_context: locked.run.trace_context.clone(),
                }],
            },
        };

        match self.transport.send(outbound).await {
            Ok(()) => {
                self.window.lock().await.count_dispatch();
                tracing::debug!(
                    event = "relay.dispatcher.dispatched",
                    run = %locked.run.friendly_id,
                    attempt = attempt.number,
                    worker = %worker.friendly_id,
                    version = %worker.version,
                    "dispatched run to worker"
                );
                Tick::Resume(self.options.dispatch_delay)
            }
            Err(err) => {
                tracing::warn!(
                    event = "relay.dispatcher.send_failed",
                    run = %locked.run.friendly_id,
                    attempt = attempt.number,
                    error = %err,
                    "transport send failed; rolling back dispatch"
                );
                {
                    let mut window = self.window.lock().await;
                    if let Some(span) = window.span() {
                        self.tracer.record_exception(span, &err.to_string());
                    }
                    window.force_rollover();
                }
                self.rollback(&locked.run, task.id, Some(attempt.id)).await;
                self.nack(message_id, None).await;
                Tick::Resume(self.options.dispatch_delay)
            }
        }
    }

    async fn roll_window_if_due(&self) {
        let mut window = self.window.lock().await;
        if !window.rollover_due() {
            return;
        }
        if let Some((span, successes, failures)) = window.close() {
            self.tracer.end_dispatch_span(&span, successes, failures);
        }
        window.open(self.tracer.start_dispatch_span(&self.environment));
    }

    /// Best-effort release of the dispatch state taken by this iteration: the
    /// run lock held by `task_id` and, when given, the just-created attempt.
    async fn rollback(&self, run: &TaskRun, task_id: Uuid, attempt_id: Option<Uuid>) {
        if let Err(err) = self
            .store
            .rollback_execution(run.id, task_id, attempt_id)
            .await
        {
            tracing::error!(
                event = "relay.dispatcher.rollback_failed",
                run = %run.friendly_id,
                error = %err,
                "failed to roll back dispatch state"
            );
        }
    }

    pub(crate) async fn ack(&self, message_id: Uuid) {
        if let Err(err) = self.queue.ack(message_id).await {
            tracing::error!(
                event = "relay.dispatcher.ack_failed",
                message_id = %message_id,
                error = %err,
                "ack failed"
            );
        }
    }

    pub(crate) async fn nack(&self, message_id: Uuid, visible_at: Option<DateTime<Utc>>) {
        if let Err(err) = self.queue.nack(message_id, visible_at).await {
            tracing::error!(
                event = "relay.dispatcher.nack_failed",
                message_id = %message_id,
                error = %err,
                "nack failed"
            );
        }
    }
}

fn build_execution(
    environment: &AuthenticatedEnvironment,
    worker: &BackgroundWorker,
    task: &BackgroundTask,
    locked: &LockedRun,
    attempt: &relay_core::model::TaskRunAttempt,
    task_queue: &TaskQueue,
) -> TaskRunExecution {
    TaskRunExecution {
        task: ExecutionTask {
            id: task.slug.clone(),
            file_path: task.file_path.clone(),
            export_name: task.export_name.clone(),
        },
        attempt: ExecutionAttempt {
            id: attempt.friendly_id.clone(),
            number: attempt.number,
            started_at: attempt.started_at,
            background_worker_id: worker.friendly_id.clone(),
            background_worker_task_id: task.friendly_id.clone(),
            status: AttemptStatus::Executing,
        },
        run: ExecutionRun {
            id: locked.run.friendly_id.clone(),
            payload: locked.run.payload.clone(),
            payload_type: locked.run.payload_type.clone(),
            context: locked.run.context.clone(),
            created_at: locked.run.created_at,
            tags: locked.tags.clone(),
        },
        queue: ExecutionQueue {
            id: task_queue.friendly_id.clone(),
            name: task_queue.name.clone(),
        },
        environment: ExecutionEnvironment {
            id: environment.friendly_id.clone(),
            slug: environment.slug.clone(),
            kind: environment.kind,
        },
        organization: ExecutionOrganization {
            id: environment.organization.friendly_id.clone(),
            slug: environment.organization.slug.clone(),
            name: environment.organization.name.clone(),
        },
        project: ExecutionProject {
            id: environment.project.friendly_id.clone(),
            external_ref: environment.project.external_ref.clone(),
            slug: environment.project.slug.clone(),
            name: environment.project.name.clone(),
        },
    }
}
