use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use relay_core::contracts::RunQueue;
use relay_core::model::QueueMessage;

/// Postgres-backed run queue with visibility timeouts. Message ids are the
/// run ids, supplied by the publisher.
#[derive(Debug, Clone)]
pub struct PgRunQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgRunQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl RunQueue for PgRunQueue {
    async fn publish(
        &self,
        queue: &str,
        message_id: Uuid,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay.queue_messages (message_id, queue_name, payload, available_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(message_id)
        .bind(queue)
        .bind(payload)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("pgqueue publish to queue={queue}"))?;

        Ok(())
    }

    async fn receive(&self, queue: &str) -> anyhow::Result<Option<QueueMessage>> {
        let visibility_millis = duration_millis(self.visibility_timeout);
        let row = sqlx::query(
            r#"
            WITH picked AS (
              SELECT message_id
              FROM relay.queue_messages
              WHERE queue_name = $1
                AND available_at <= now()
                AND (invisible_until IS NULL OR invisible_until <= now())
              ORDER BY available_at, created_at
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE relay.queue_messages AS m
            SET invisible_until = now() + ($2::text || ' milliseconds')::interval,
                deliveries = deliveries + 1
            FROM picked
            WHERE m.message_id = picked.message_id
            RETURNING m.message_id, m.queue_name, m.payload, m.deliveries
            "#,
        )
        .bind(queue)
        .bind(visibility_millis)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("pgqueue receive from queue={queue}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(QueueMessage {
            message_id: row.try_get("message_id")?,
            queue_name: row.try_get("queue_name")?,
            payload: row.try_get("payload")?,
            deliveries: row.try_get("deliveries")?,
        }))
    }

    async fn ack(&self, message_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            DELETE FROM relay.queue_messages
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("pgqueue ack")?;

        Ok(())
    }

    async fn nack(
        &self,
        message_id: Uuid,
        visible_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE relay.queue_messages
            SET available_at = COALESCE($2, now()),
                invisible_until = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .context("pgqueue nack")?;

        Ok(())
    }

    async fn heartbeat(&self, message_id: Uuid, extend: Duration) -> anyhow::Result<()> {
        let extend_millis = duration_millis(extend);
        sqlx::query(
            r#"
            UPDATE relay.queue_messages
            SET invisible_until = now() + ($2::text || ' milliseconds')::interval
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(extend_millis)
        .execute(&self.pool)
        .await
        .context("pgqueue heartbeat")?;

        Ok(())
    }
}

fn duration_millis(d: Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}
