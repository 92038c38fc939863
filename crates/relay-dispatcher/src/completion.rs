//! Reactions to run-completed and heartbeat messages from the worker.
//!
//! These run on the transport's task and interleave with dispatch iterations,
//! but they operate on disjoint attempts: the loop creates, this module
//! finalizes.

use chrono::{DateTime, Utc};

use relay_core::contracts::{AttemptOutcome, RetryDelayEvent};
use relay_core::execution::TaskRunExecution;
use relay_core::messages::{RunCompletion, WorkerEvent};
use relay_core::model::{TaskRunAttempt, TaskRetryConfig};
use relay_core::retry_span::{deterministic_span_id, retry_span_seed, RETRY_EVENT_ICON};

use crate::dispatcher::Dispatcher;

impl Dispatcher {
    pub async fn handle_worker_event(&self, event: WorkerEvent) -> anyhow::Result<()> {
        match event {
            WorkerEvent::TaskRunCompleted {
                completion,
                execution,
            } => self.handle_completion(completion, execution).await,
            WorkerEvent::TaskHeartbeat { id } => self.handle_heartbeat(&id).await,
        }
    }

    /// Finalize the attempt named by the completion, bump the window counter,
    /// and settle the queue message: ack on success or terminal failure, nack
    /// at the worker-supplied retry timestamp otherwise.
    pub async fn handle_completion(
        &self,
        completion: RunCompletion,
        execution: TaskRunExecution,
    ) -> anyhow::Result<()> {
        let friendly_attempt_id = completion.attempt_friendly_id();
        let attempt = self
            .inner
            .store
            .find_attempt_by_friendly_id(friendly_attempt_id)
            .await?;

        let Some(attempt) = attempt else {
            tracing::warn!(
                event = "relay.dispatcher.completion.unknown_attempt",
                attempt = friendly_attempt_id,
                run = %execution.run.id,
                "completion for unknown attempt; leaving message to visibility timeout"
            );
            return Ok(());
        };

        let now = Utc::now();
        match completion {
            RunCompletion::Success(success) => {
                let finished = self
                    .inner
                    .store
                    .finish_attempt(
                        attempt.id,
                        AttemptOutcome::Completed {
                            output: success.output,
                            output_type: success.output_type,
                        },
                        now,
                    )
                    .await?;
                self.inner.window.lock().await.count_success();

                tracing::debug!(
                    event = "relay.dispatcher.completion.succeeded",
                    attempt = %finished.friendly_id,
                    run = %execution.run.id,
                    number = finished.number,
                    "attempt completed"
                );
                self.inner.queue.ack(attempt.run_id).await
            }
            RunCompletion::Failure(failure) => {
                let finished = self
                    .inner
                    .store
                    .finish_attempt(
                        attempt.id,
                        AttemptOutcome::Failed {
                            error: failure.error.clone(),
                        },
                        now,
                    )
                    .await?;
                self.inner.window.lock().await.count_failure();

                match failure.retry {
                    Some(retry) => {
                        tracing::debug!(
                            event = "relay.dispatcher.completion.retrying",
                            attempt = %finished.friendly_id,
                            run = %execution.run.id,
                            number = finished.number,
                            visible_at = %retry.timestamp,
                            "attempt failed; scheduling retry"
                        );
                        self.record_retry_delay(&attempt, retry.timestamp).await?;
                        self.inner
                            .queue
                            .nack(attempt.run_id, Some(retry.timestamp))
                            .await
                    }
                    None => {
                        tracing::debug!(
                            event = "relay.dispatcher.completion.failed",
                            attempt = %finished.friendly_id,
                            run = %execution.run.id,
                            number = finished.number,
                            "attempt failed terminally"
                        );
                        self.inner.queue.ack(attempt.run_id).await
                    }
                }
            }
        }
    }

    async fn record_retry_delay(
        &self,
        attempt: &TaskRunAttempt,
        visible_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(run) = self.inner.store.find_run(attempt.run_id).await? else {
            return Ok(());
        };

        let policy = self
            .inner
            .store
            .find_task(attempt.background_worker_task_id)
            .await?
            .and_then(|task| task.retry_config.as_ref().map(TaskRetryConfig::with_defaults));

        let message = match policy {
            Some(policy) => format!(
                "Retry {}/{} delay",
                attempt.number,
                policy.max_attempts.saturating_sub(1)
            ),
            None => format!("Retry #{} delay", attempt.number),
        };

        let next_number = attempt.number + 1;
        let event = RetryDelayEvent {
            message,
            end_time: visible_at,
            icon: RETRY_EVENT_ICON.to_string(),
            span_id: deterministic_span_id(&run.trace_context, &retry_span_seed(next_number)),
        };

        self.inner.tracer.record_retry_event(&run, &event).await
    }

    /// Extend the queue message's visibility for a still-executing attempt.
    /// Unknown attempts are a silent no-op.
    pub async fn handle_heartbeat(&self, attempt_friendly_id: &str) -> anyhow::Result<()> {
        let attempt = self
            .inner
            .store
            .find_attempt_by_friendly_id(attempt_friendly_id)
            .await?;

        let Some(attempt) = attempt else {
            return Ok(());
        };

        self.inner
            .queue
            .heartbeat(attempt.run_id, self.inner.options.heartbeat_extension)
            .await
    }
}
