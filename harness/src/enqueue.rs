use anyhow::Context;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use relay_core::contracts::RunQueue;
use relay_core::ids;

use crate::config::RelayConfig;
use crate::pgqueue::PgRunQueue;

/// Insert a task run and publish its EXECUTE message.
///
/// This exists purely to make manual testing ergonomic: `serve` can run in
/// one terminal and runs can be enqueued without opening psql.
pub async fn run(
    cfg: &RelayConfig,
    environment_id: Uuid,
    task_identifier: &str,
    queue_name: &str,
    payload: &str,
) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect relay db")?;

    sqlx::query(
        r#"
        INSERT INTO relay.task_queues (id, friendly_id, name, environment_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (environment_id, name) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(ids::friendly_id("queue"))
    .bind(queue_name)
    .bind(environment_id)
    .execute(&pool)
    .await
    .context("ensure task queue row")?;

    let run_id = Uuid::new_v4();
    let friendly_run_id = ids::friendly_id("run");
    let trace_context = serde_json::json!({
        "traceparent": format!(
            "00-{}-{}-01",
            run_id.simple(),
            &Uuid::new_v4().simple().to_string()[..16]
        ),
    });

    sqlx::query(
        r#"
        INSERT INTO relay.task_runs (
          id, friendly_id, environment_id, task_identifier, queue_name,
          payload, payload_type, trace_context, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(run_id)
    .bind(&friendly_run_id)
    .bind(environment_id)
    .bind(task_identifier)
    .bind(queue_name)
    .bind(payload)
    .bind("application/json")
    .bind(&trace_context)
    .bind(Utc::now())
    .execute(&pool)
    .await
    .context("insert task run")?;

    let queue = PgRunQueue::new(pool, cfg.visibility_timeout());
    queue
        .publish(
            &format!("env:{environment_id}"),
            run_id,
            serde_json::json!({"type": "EXECUTE", "taskIdentifier": task_identifier}),
            Utc::now(),
        )
        .await?;

    tracing::info!(
        run = %friendly_run_id,
        task = task_identifier,
        queue = queue_name,
        "enqueued task run"
    );
    Ok(())
}
