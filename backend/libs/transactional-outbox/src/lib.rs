//! Transactional outbox: reliable event publishing for the saga services.
//!
//! Business state and the events it implies are written in one local
//! database transaction; a background publisher later ships pending rows
//! to the message bus and marks them published. This gives at-least-once
//! delivery from each service's database to the bus, which combined with
//! idempotent consumers yields exactly-once effect.
//!
//! Every service owns an `outbox` table of the same shape (see each
//! service's migrations). Rows transition `pending -> published`
//! (terminal) or, after repeated publish failures, `pending -> failed`;
//! failed rows can be reset for another round with
//! [`OutboxPublisher::retry_failed`].

use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use message_bus::MessageBus;
use saga_events::SagaEvent;

mod error;

pub use error::{OutboxError, OutboxResult};

/// Lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Write an event into the outbox inside the caller's transaction.
///
/// Must be called within the same transaction as the business change the
/// event describes; committing the transaction makes both durable
/// atomically.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    event: &SagaEvent,
) -> OutboxResult<()> {
    let payload = serde_json::to_value(event)?;

    sqlx::query(
        r#"
        INSERT INTO outbox (id, event_id, event_type, aggregate_id, payload, status, retry_count, created_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.event_id)
    .bind(event.routing_key())
    .bind(event.aggregate_id)
    .bind(payload)
    .execute(&mut **tx)
    .await?;

    debug!(
        event_id = %event.event_id,
        event_type = event.routing_key(),
        aggregate_id = %event.aggregate_id,
        "event enqueued in outbox"
    );

    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    event_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    retry_count: i32,
}

/// Publisher tunables.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 3,
        }
    }
}

/// Background worker that drains pending outbox rows to the bus.
///
/// Rows are claimed with `FOR UPDATE SKIP LOCKED`, so multiple publisher
/// instances against the same database do not double-publish.
pub struct OutboxPublisher {
    pool: PgPool,
    bus: Arc<MessageBus>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(pool: PgPool, bus: Arc<MessageBus>, config: PublisherConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Poll loop; runs until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox publisher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("outbox publisher stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.process_batch().await {
                        Ok(0) => {}
                        Ok(count) => info!(published = count, "published events from outbox"),
                        Err(e) => error!(error = %e, "outbox publisher batch failed"),
                    }
                }
            }
        }
    }

    /// Claim and publish one batch of pending rows.
    ///
    /// Returns the number of rows successfully published.
    pub async fn process_batch(&self) -> OutboxResult<usize> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, event_type, payload, retry_count
            FROM outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut published = 0;

        for row in rows {
            match serde_json::from_value::<SagaEvent>(row.payload.clone()) {
                Ok(event) => match self.bus.publish(&event).await {
                    Ok(()) => {
                        sqlx::query(
                            "UPDATE outbox SET status = 'published', published_at = NOW() WHERE id = $1",
                        )
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                        published += 1;
                    }
                    Err(e) => {
                        self.record_failure(&mut tx, &row, &e.to_string()).await?;
                    }
                },
                Err(e) => {
                    // A row that no longer deserializes will never publish;
                    // let it run out its retries and surface as failed.
                    self.record_failure(
                        &mut tx,
                        &row,
                        &format!("payload deserialization failed: {e}"),
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(published)
    }

    async fn record_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &OutboxRow,
        error_message: &str,
    ) -> OutboxResult<()> {
        let (status, retry_count) = failure_transition(row.retry_count, self.config.max_retries);

        sqlx::query(
            "UPDATE outbox SET status = $2, retry_count = $3, last_error = $4 WHERE id = $1",
        )
        .bind(row.id)
        .bind(status.as_str())
        .bind(retry_count)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;

        if status == OutboxStatus::Failed {
            error!(
                event_id = %row.event_id,
                event_type = %row.event_type,
                retry_count,
                error = error_message,
                "outbox event exceeded max retries, marked failed"
            );
        } else {
            warn!(
                event_id = %row.event_id,
                event_type = %row.event_type,
                retry_count,
                error = error_message,
                "outbox publish failed, will retry"
            );
        }

        Ok(())
    }

    /// Reset failed rows to pending so the poll loop picks them up again.
    pub async fn retry_failed(&self, limit: i64) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', retry_count = 0, last_error = NULL
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'failed'
                ORDER BY created_at ASC
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        info!(reset, "reset failed outbox events for retry");
        Ok(reset)
    }

    /// Pending row count and age of the oldest pending row in seconds.
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending")?;
        let age: i64 = row.try_get("age_seconds")?;
        Ok((pending, age))
    }
}

/// Status transition after a failed publish attempt.
fn failure_transition(retry_count: i32, max_retries: i32) -> (OutboxStatus, i32) {
    let next = retry_count + 1;
    if next >= max_retries {
        (OutboxStatus::Failed, next)
    } else {
        (OutboxStatus::Pending, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_transition_fails_row_at_max_retries() {
        assert_eq!(failure_transition(0, 3), (OutboxStatus::Pending, 1));
        assert_eq!(failure_transition(1, 3), (OutboxStatus::Pending, 2));
        assert_eq!(failure_transition(2, 3), (OutboxStatus::Failed, 3));
        assert_eq!(failure_transition(5, 3), (OutboxStatus::Failed, 6));
    }

    #[test]
    fn status_strings_match_the_table_values() {
        assert_eq!(OutboxStatus::Pending.as_str(), "pending");
        assert_eq!(OutboxStatus::Published.as_str(), "published");
        assert_eq!(OutboxStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn default_config_matches_service_defaults() {
        let config = PublisherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 3);
    }
}
