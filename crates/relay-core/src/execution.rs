//! The execution descriptor handed to the remote worker.
//!
//! Only human-readable friendly ids cross this boundary; internal database
//! keys never do. `task.id` carries the task slug, the identifier the worker
//! dispatches on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{AttemptStatus, EnvironmentKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunExecution {
    pub task: ExecutionTask,
    pub attempt: ExecutionAttempt,
    pub run: ExecutionRun,
    pub queue: ExecutionQueue,
    pub environment: ExecutionEnvironment,
    pub organization: ExecutionOrganization,
    pub project: ExecutionProject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub id: String,
    pub file_path: String,
    pub export_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAttempt {
    pub id: String,
    pub number: i32,
    pub started_at: DateTime<Utc>,
    pub background_worker_id: String,
    pub background_worker_task_id: String,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub id: String,
    pub payload: String,
    pub payload_type: String,
    #[serde(default)]
    pub context: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueue {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnvironment {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub kind: EnvironmentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOrganization {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProject {
    pub id: String,
    #[serde(rename = "ref")]
    pub external_ref: String,
    pub slug: String,
    pub name: String,
}
