use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use relay_core::contracts::{AttemptOutcome, LockedRun, NewAttempt, RunStore};
use relay_core::model::{
    AttemptStatus, AuthenticatedEnvironment, BackgroundTask, BackgroundWorker, EnvironmentKind,
    Organization, Project, TaskQueue, TaskRun, TaskRunAttempt, TaskRetryConfig,
};

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the tenant context for a connecting worker. Authentication
    /// proper happens upstream; this is a plain key lookup.
    pub async fn find_environment_by_api_key(
        &self,
        api_key: &str,
    ) -> anyhow::Result<Option<AuthenticatedEnvironment>> {
        let row = sqlx::query(
            r#"
            SELECT
              e.id, e.friendly_id, e.slug, e.kind,
              o.id AS org_id, o.friendly_id AS org_friendly_id,
              o.slug AS org_slug, o.name AS org_name,
              p.id AS project_id, p.friendly_id AS project_friendly_id,
              p.external_ref, p.slug AS project_slug, p.name AS project_name
            FROM relay.environments e
            JOIN relay.organizations o ON o.id = e.organization_id
            JOIN relay.projects p ON p.id = e.project_id
            WHERE e.api_key = $1
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .context("select environment by api key")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.try_get("kind")?;
        Ok(Some(AuthenticatedEnvironment {
            id: row.try_get("id")?,
            friendly_id: row.try_get("friendly_id")?,
            slug: row.try_get("slug")?,
            kind: kind.parse::<EnvironmentKind>()?,
            organization: Organization {
                id: row.try_get("org_id")?,
                friendly_id: row.try_get("org_friendly_id")?,
                slug: row.try_get("org_slug")?,
                name: row.try_get("org_name")?,
            },
            project: Project {
                id: row.try_get("project_id")?,
                friendly_id: row.try_get("project_friendly_id")?,
                external_ref: row.try_get("external_ref")?,
                slug: row.try_get("project_slug")?,
                name: row.try_get("project_name")?,
            },
        }))
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn find_worker_by_friendly_id(
        &self,
        environment_id: Uuid,
        friendly_id: &str,
    ) -> anyhow::Result<Option<BackgroundWorker>> {
        let row = sqlx::query(
            r#"
            SELECT id, friendly_id, version
            FROM relay.background_workers
            WHERE environment_id = $1
              AND friendly_id = $2
            "#,
        )
        .bind(environment_id)
        .bind(friendly_id)
        .fetch_optional(&self.pool)
        .await
        .context("select background worker")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let worker_id: Uuid = row.try_get("id")?;
        let task_rows = sqlx::query(
            r#"
            SELECT id, friendly_id, slug, file_path, export_name, retry_config
            FROM relay.background_worker_tasks
            WHERE worker_id = $1
            ORDER BY slug
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .context("select background worker tasks")?;

        let tasks = task_rows
            .iter()
            .map(task_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Some(BackgroundWorker {
            id: worker_id,
            friendly_id: row.try_get("friendly_id")?,
            version: row.try_get("version")?,
            tasks,
        }))
    }

    async fn find_run(&self, run_id: Uuid) -> anyhow::Result<Option<TaskRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, friendly_id, task_identifier, queue_name, payload, payload_type,
                   context, trace_context, created_at,
                   locked_at, locked_by_task_id, locked_to_version_id
            FROM relay.task_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("select task run")?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn lock_run(
        &self,
        run_id: Uuid,
        task_id: Uuid,
        locked_at: DateTime<Utc>,
    ) -> anyhow::Result<LockedRun> {
        let mut tx = self.pool.begin().await.context("begin lock_run tx")?;

        let row = sqlx::query(
            r#"
            UPDATE relay.task_runs
            SET locked_at = $2,
                locked_by_task_id = $3
            WHERE id = $1
              AND locked_at IS NULL
            RETURNING id, friendly_id, task_identifier, queue_name, payload, payload_type,
                      context, trace_context, created_at,
                      locked_at, locked_by_task_id, locked_to_version_id
            "#,
        )
        .bind(run_id)
        .bind(locked_at)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock task run")?;

        // zero rows covers both a deleted run and one still held by another
        // executing attempt
        let Some(row) = row else {
            anyhow::bail!("task run {run_id} missing or already locked");
        };
        let run = run_from_row(&row)?;

        let last_attempt_number: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT number
            FROM relay.task_run_attempts
            WHERE run_id = $1
            ORDER BY number DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .context("select last attempt number")?;

        let tags: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name
            FROM relay.task_run_tags
            WHERE run_id = $1
            ORDER BY name
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await
        .context("select run tags")?;

        tx.commit().await.context("commit lock_run tx")?;

        Ok(LockedRun {
            run,
            last_attempt_number: last_attempt_number.unwrap_or(0),
            tags,
        })
    }

    async fn find_queue(
        &self,
        environment_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<TaskQueue>> {
        let row = sqlx::query(
            r#"
            SELECT id, friendly_id, name, environment_id
            FROM relay.task_queues
            WHERE environment_id = $1
              AND name = $2
            "#,
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("select task queue")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TaskQueue {
            id: row.try_get("id")?,
            friendly_id: row.try_get("friendly_id")?,
            name: row.try_get("name")?,
            environment_id: row.try_get("environment_id")?,
        }))
    }

    async fn create_attempt(&self, attempt: NewAttempt) -> anyhow::Result<TaskRunAttempt> {
        let row = sqlx::query(
            r#"
            INSERT INTO relay.task_run_attempts (
              id, friendly_id, run_id, number, status, started_at,
              queue_id, background_worker_id, background_worker_task_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, friendly_id, run_id, number, status, started_at, completed_at,
                      output, output_type, error,
                      queue_id, background_worker_id, background_worker_task_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&attempt.friendly_id)
        .bind(attempt.run_id)
        .bind(attempt.number)
        .bind(AttemptStatus::Executing.as_str())
        .bind(attempt.started_at)
        .bind(attempt.queue_id)
        .bind(attempt.background_worker_id)
        .bind(attempt.background_worker_task_id)
        .fetch_one(&self.pool)
        .await
        .context("insert task run attempt")?;

        attempt_from_row(&row)
    }

    async fn rollback_execution(
        &self,
        run_id: Uuid,
        locked_by_task_id: Uuid,
        attempt_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin rollback tx")?;

        // scoped to the lock holder: a stale rollback must not clear a lock
        // taken by a later iteration
        sqlx::query(
            r#"
            UPDATE relay.task_runs
            SET locked_at = NULL,
                locked_by_task_id = NULL
            WHERE id = $1
              AND locked_by_task_id = $2
            "#,
        )
        .bind(run_id)
        .bind(locked_by_task_id)
        .execute(&mut *tx)
        .await
        .context("unlock task run")?;

        if let Some(attempt_id) = attempt_id {
            sqlx::query(
                r#"
                DELETE FROM relay.task_run_attempts
                WHERE id = $1
                "#,
            )
            .bind(attempt_id)
            .execute(&mut *tx)
            .await
            .context("delete rolled-back attempt")?;
        }

        tx.commit().await.context("commit rollback tx")?;
        Ok(())
    }

    async fn find_attempt_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> anyhow::Result<Option<TaskRunAttempt>> {
        let row = sqlx::query(
            r#"
            SELECT id, friendly_id, run_id, number, status, started_at, completed_at,
                   output, output_type, error,
                   queue_id, background_worker_id, background_worker_task_id
            FROM relay.task_run_attempts
            WHERE friendly_id = $1
            "#,
        )
        .bind(friendly_id)
        .fetch_optional(&self.pool)
        .await
        .context("select attempt by friendly id")?;

        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<TaskRunAttempt> {
        let mut tx = self.pool.begin().await.context("begin finish_attempt tx")?;

        let row = match outcome {
            AttemptOutcome::Completed {
                output,
                output_type,
            } => sqlx::query(
                r#"
                UPDATE relay.task_run_attempts
                SET status = $2,
                    output = $3,
                    output_type = $4,
                    completed_at = $5
                WHERE id = $1
                RETURNING id, friendly_id, run_id, number, status, started_at, completed_at,
                          output, output_type, error,
                          queue_id, background_worker_id, background_worker_task_id
                "#,
            )
            .bind(attempt_id)
            .bind(AttemptStatus::Completed.as_str())
            .bind(output)
            .bind(output_type)
            .bind(completed_at)
            .fetch_one(&mut *tx)
            .await
            .context("mark attempt completed")?,
            AttemptOutcome::Failed { error } => sqlx::query(
                r#"
                UPDATE relay.task_run_attempts
                SET status = $2,
                    error = $3,
                    completed_at = $4
                WHERE id = $1
                RETURNING id, friendly_id, run_id, number, status, started_at, completed_at,
                          output, output_type, error,
                          queue_id, background_worker_id, background_worker_task_id
                "#,
            )
            .bind(attempt_id)
            .bind(AttemptStatus::Failed.as_str())
            .bind(error)
            .bind(completed_at)
            .fetch_one(&mut *tx)
            .await
            .context("mark attempt failed")?,
        };

        let attempt = attempt_from_row(&row)?;

        // the settled attempt's task releases the run lock; a redelivery can
        // then lock the run for the next attempt
        sqlx::query(
            r#"
            UPDATE relay.task_runs
            SET locked_at = NULL,
                locked_by_task_id = NULL
            WHERE id = $1
              AND locked_by_task_id = $2
            "#,
        )
        .bind(attempt.run_id)
        .bind(attempt.background_worker_task_id)
        .execute(&mut *tx)
        .await
        .context("release run lock")?;

        tx.commit().await.context("commit finish_attempt tx")?;
        Ok(attempt)
    }

    async fn find_task(&self, task_id: Uuid) -> anyhow::Result<Option<BackgroundTask>> {
        let row = sqlx::query(
            r#"
            SELECT id, friendly_id, slug, file_path, export_name, retry_config
            FROM relay.background_worker_tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("select background worker task")?;

        row.as_ref().map(task_from_row).transpose()
    }
}

fn run_from_row(row: &PgRow) -> anyhow::Result<TaskRun> {
    Ok(TaskRun {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        task_identifier: row.try_get("task_identifier")?,
        queue_name: row.try_get("queue_name")?,
        payload: row.try_get("payload")?,
        payload_type: row.try_get("payload_type")?,
        context: row.try_get("context")?,
        trace_context: row.try_get("trace_context")?,
        created_at: row.try_get("created_at")?,
        locked_at: row.try_get("locked_at")?,
        locked_by_task_id: row.try_get("locked_by_task_id")?,
        locked_to_version_id: row.try_get("locked_to_version_id")?,
    })
}

fn attempt_from_row(row: &PgRow) -> anyhow::Result<TaskRunAttempt> {
    let status: String = row.try_get("status")?;
    Ok(TaskRunAttempt {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        run_id: row.try_get("run_id")?,
        number: row.try_get("number")?,
        status: status.parse::<AttemptStatus>()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        output: row.try_get("output")?,
        output_type: row.try_get("output_type")?,
        error: row.try_get("error")?,
        queue_id: row.try_get("queue_id")?,
        background_worker_id: row.try_get("background_worker_id")?,
        background_worker_task_id: row.try_get("background_worker_task_id")?,
    })
}

fn task_from_row(row: &PgRow) -> anyhow::Result<BackgroundTask> {
    let retry_config: Option<Value> = row.try_get("retry_config")?;
    let retry_config = retry_config
        .map(serde_json::from_value::<TaskRetryConfig>)
        .transpose()
        .context("decode task retry config")?;

    Ok(BackgroundTask {
        id: row.try_get("id")?,
        friendly_id: row.try_get("friendly_id")?,
        slug: row.try_get("slug")?,
        file_path: row.try_get("file_path")?,
        export_name: row.try_get("export_name")?,
        retry_config,
    })
}
