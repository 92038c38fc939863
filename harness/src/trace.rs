use async_trait::async_trait;
use uuid::Uuid;

use relay_core::contracts::{RetryDelayEvent, SpanHandle, TraceRecorder};
use relay_core::model::{AuthenticatedEnvironment, TaskRun};

/// Trace recorder backed by structured logging. Span storage stays external;
/// this keeps the window/event protocol observable without it.
#[derive(Debug, Default, Clone)]
pub struct LogTraceRecorder;

#[async_trait]
impl TraceRecorder for LogTraceRecorder {
    fn start_dispatch_span(&self, environment: &AuthenticatedEnvironment) -> SpanHandle {
        let span = SpanHandle { id: Uuid::new_v4() };
        tracing::info!(
            event = "relay.trace.window_opened",
            span = %span.id,
            environment = %environment.friendly_id,
            environment_type = environment.kind.as_str(),
            organization = %environment.organization.slug,
            project = %environment.project.slug,
            "opened dispatch window"
        );
        span
    }

    fn end_dispatch_span(&self, span: &SpanHandle, successes: u64, failures: u64) {
        tracing::info!(
            event = "relay.trace.window_closed",
            span = %span.id,
            tasks.period.successes = successes,
            tasks.period.failures = failures,
            "closed dispatch window"
        );
    }

    fn record_exception(&self, span: &SpanHandle, message: &str) {
        tracing::warn!(
            event = "relay.trace.exception",
            span = %span.id,
            error = message,
            "exception recorded on dispatch window"
        );
    }

    async fn record_retry_event(
        &self,
        run: &TaskRun,
        event: &RetryDelayEvent,
    ) -> anyhow::Result<()> {
        tracing::info!(
            event = "relay.trace.retry_delay",
            run = %run.friendly_id,
            span_id = %event.span_id,
            label = %event.message,
            end_time = %event.end_time,
            icon = %event.icon,
            "recorded retry delay event"
        );
        Ok(())
    }
}
