use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentKind {
    Production,
    Staging,
    Development,
}

impl EnvironmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentKind::Production => "PRODUCTION",
            EnvironmentKind::Staging => "STAGING",
            EnvironmentKind::Development => "DEVELOPMENT",
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRODUCTION" => Ok(EnvironmentKind::Production),
            "STAGING" => Ok(EnvironmentKind::Staging),
            "DEVELOPMENT" => Ok(EnvironmentKind::Development),
            other => Err(anyhow!("unknown environment kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub id: Uuid,
    pub friendly_id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: Uuid,
    pub friendly_id: String,
    pub external_ref: String,
    pub slug: String,
    pub name: String,
}

/// Tenant context for one worker connection. Immutable for the lifetime of the
/// connection; also identifies the logical queue the dispatcher pulls from.
#[derive(Debug, Clone)]
pub struct AuthenticatedEnvironment {
    pub id: Uuid,
    pub friendly_id: String,
    pub slug: String,
    pub kind: EnvironmentKind,
    pub organization: Organization,
    pub project: Project,
}

impl AuthenticatedEnvironment {
    /// Name of the per-environment logical queue.
    pub fn queue_id(&self) -> String {
        format!("env:{}", self.id)
    }
}

/// A versioned task bundle the remote worker has loaded.
#[derive(Debug, Clone)]
pub struct BackgroundWorker {
    pub id: Uuid,
    pub friendly_id: String,
    pub version: String,
    pub tasks: Vec<BackgroundTask>,
}

impl BackgroundWorker {
    pub fn task_by_slug(&self, slug: &str) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|task| task.slug == slug)
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub id: Uuid,
    pub friendly_id: String,
    pub slug: String,
    pub file_path: String,
    pub export_name: String,
    pub retry_config: Option<TaskRetryConfig>,
}

/// Per-task retry settings as declared by the worker bundle. All fields are
/// optional; a task with no config at all reports an unknown retry ceiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub min_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_timeout_ms: Option<u64>,
    #[serde(default)]
    pub randomize: Option<bool>,
}

impl TaskRetryConfig {
    pub fn with_defaults(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(RetryPolicy::DEFAULT.max_attempts),
            factor: self.factor.unwrap_or(RetryPolicy::DEFAULT.factor),
            min_timeout_ms: self
                .min_timeout_ms
                .unwrap_or(RetryPolicy::DEFAULT.min_timeout_ms),
            max_timeout_ms: self
                .max_timeout_ms
                .unwrap_or(RetryPolicy::DEFAULT.max_timeout_ms),
            randomize: self.randomize.unwrap_or(RetryPolicy::DEFAULT.randomize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub randomize: bool,
}

impl RetryPolicy {
    pub const DEFAULT: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        factor: 2.0,
        min_timeout_ms: 1_000,
        max_timeout_ms: 60_000,
        randomize: true,
    };
}

/// Canonical run state. The run id doubles as the queue message id.
///
/// Invariants: `locked_at` and `locked_by_task_id` are set and cleared
/// together; `locked_to_version_id` never changes once set.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: Uuid,
    pub friendly_id: String,
    pub task_identifier: String,
    pub queue_name: String,
    pub payload: String,
    pub payload_type: String,
    pub context: Option<Value>,
    pub trace_context: Value,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by_task_id: Option<Uuid>,
    pub locked_to_version_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Executing,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Executing => "EXECUTING",
            AttemptStatus::Completed => "COMPLETED",
            AttemptStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTING" => Ok(AttemptStatus::Executing),
            "COMPLETED" => Ok(AttemptStatus::Completed),
            "FAILED" => Ok(AttemptStatus::Failed),
            other => Err(anyhow!("unknown attempt status '{other}'")),
        }
    }
}

/// One execution try of a run. At most one attempt per run is `Executing`.
#[derive(Debug, Clone)]
pub struct TaskRunAttempt {
    pub id: Uuid,
    pub friendly_id: String,
    pub run_id: Uuid,
    pub number: i32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub output_type: Option<String>,
    pub error: Option<String>,
    pub queue_id: Uuid,
    pub background_worker_id: Uuid,
    pub background_worker_task_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    pub id: Uuid,
    pub friendly_id: String,
    pub name: String,
    pub environment_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub queue_name: String,
    pub payload: Value,
    pub deliveries: i32,
}
