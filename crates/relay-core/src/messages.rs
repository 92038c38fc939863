//! Wire schemas: queue message bodies and websocket frames.
//!
//! Discriminators are SCREAMING_SNAKE, field names camelCase. Unknown queue
//! message discriminators fail deserialization and are treated as poison by
//! the dispatch loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::TaskRunExecution;

/// Body of a run message on the environment queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum RunMessageBody {
    Execute { task_identifier: String },
}

/// Frames the remote worker sends to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WorkerToServer {
    ReadyForTasks {
        background_worker_id: String,
    },
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerEvent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    TaskRunCompleted {
        completion: RunCompletion,
        execution: TaskRunExecution,
    },
    /// `id` is the friendly id of the executing attempt.
    TaskHeartbeat { id: String },
}

/// Worker-reported outcome of one attempt. `id` is the attempt's friendly id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCompletion {
    Failure(FailedRunCompletion),
    Success(SuccessfulRunCompletion),
}

impl RunCompletion {
    pub fn attempt_friendly_id(&self) -> &str {
        match self {
            RunCompletion::Failure(failure) => &failure.id,
            RunCompletion::Success(success) => &success.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessfulRunCompletion {
    pub ok: bool,
    pub id: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub output_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRunCompletion {
    pub ok: bool,
    pub id: String,
    pub error: String,
    #[serde(default)]
    pub retry: Option<CompletionRetry>,
}

/// The worker computes backoff; the dispatcher only honours the timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRetry {
    pub timestamp: DateTime<Utc>,
}

/// Frames the dispatcher sends to the remote worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerToWorker {
    ServerReady {
        id: String,
    },
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: ServerEvent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ExecuteRuns { payloads: Vec<ExecutePayload> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub execution: TaskRunExecution,
    /// The run's stored trace context, forwarded verbatim.
    pub trace_context: Value,
}
