// The reservation engine: moves subscription-message rows through
// waiting -> processing -> completed | failed under concurrent consumers.
//
// Contention is resolved row-by-row: candidates are selected with
// `FOR UPDATE ... SKIP LOCKED`, so competing transactions never wait on each
// other and never reserve the same row. Sequential subscriptions add a gate:
// the subscription row itself is locked and its `processing` flag checked,
// which totally orders deliveries across processes.
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ConsumptionMode, Message, RetryStrategy, SubscriptionRecord};

/// A message reserved for one handler invocation.
#[derive(Debug, Clone)]
pub(crate) struct ReservedMessage {
    pub message: Message,
    /// Attempt counter after this reservation, 1-based.
    pub attempts: i32,
}

/// Reserve up to `limit` messages for the subscription, transitioning them
/// to `processing` with a fresh heartbeat. Returns the reserved rows in
/// `(priority, id)` order; empty when nothing is available or, in
/// sequential mode, when another message is already in flight.
pub(crate) async fn reserve_next(
    db: &PgPool,
    subscription: &SubscriptionRecord,
    limit: i64,
) -> Result<Vec<ReservedMessage>> {
    let sequential = subscription.consumption_mode == ConsumptionMode::Sequential;
    let limit = if sequential { 1 } else { limit };
    let now = Utc::now();

    let mut tx = db.begin().await?;

    if sequential {
        // Row lock serializes the gate check; the flag itself survives a
        // crashed process and is cleared by the stale sweep.
        let (in_flight,): (bool,) =
            sqlx::query_as("SELECT processing FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(subscription.id)
                .fetch_one(&mut *tx)
                .await?;
        if in_flight {
            return Ok(Vec::new());
        }
    }

    let candidates: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT sm.message_id
         FROM subscription_messages sm
         JOIN messages m ON m.id = sm.message_id
         WHERE sm.subscription_id = $1
           AND sm.status = 'waiting'
           AND (sm.available_at IS NULL OR sm.available_at <= $2)
         ORDER BY m.priority ASC NULLS LAST, m.id ASC
         LIMIT $3
         FOR UPDATE OF sm SKIP LOCKED",
    )
    .bind(subscription.id)
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = candidates.into_iter().map(|(id,)| id).collect();

    if sequential {
        sqlx::query("UPDATE subscriptions SET processing = TRUE WHERE id = $1")
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "UPDATE subscription_messages
         SET status = 'processing', attempts = attempts + 1,
             last_heartbeat_at = $3, progress = NULL
         WHERE subscription_id = $1 AND message_id = ANY($2)",
    )
    .bind(subscription.id)
    .bind(&ids)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let rows: Vec<(Uuid, Uuid, Value, Option<DateTime<Utc>>, Option<i32>, DateTime<Utc>, i32)> =
        sqlx::query_as(
            "SELECT m.id, m.topic_id, m.payload, m.deliver_at, m.priority, m.created_at, sm.attempts
             FROM subscription_messages sm
             JOIN messages m ON m.id = sm.message_id
             WHERE sm.subscription_id = $1 AND sm.message_id = ANY($2)
             ORDER BY m.priority ASC NULLS LAST, m.id ASC",
        )
        .bind(subscription.id)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(rows
        .into_iter()
        .map(|(id, topic_id, payload, deliver_at, priority, created_at, attempts)| {
            ReservedMessage {
                message: Message {
                    id,
                    topic_id,
                    payload,
                    deliver_at,
                    priority,
                    created_at,
                },
                attempts,
            }
        })
        .collect())
}

/// Acknowledge a processed message. Idempotent: only a `processing` row
/// transitions, so a second completion is a no-op.
pub(crate) async fn complete(
    db: &PgPool,
    subscription: &SubscriptionRecord,
    message_id: Uuid,
) -> Result<()> {
    let mut tx = db.begin().await?;
    sqlx::query(
        "UPDATE subscription_messages SET status = 'completed'
         WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing'",
    )
    .bind(subscription.id)
    .bind(message_id)
    .execute(&mut *tx)
    .await?;
    if subscription.consumption_mode == ConsumptionMode::Sequential {
        clear_gate(&mut tx, subscription.id).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Record a handler failure: back to `waiting` with a bumped
/// `available_at` while attempts remain, `failed` once they are exhausted.
pub(crate) async fn fail(
    db: &PgPool,
    subscription: &SubscriptionRecord,
    message_id: Uuid,
    attempts: i32,
    error: &str,
) -> Result<()> {
    let mut tx = db.begin().await?;
    if attempts >= subscription.max_attempts {
        sqlx::query(
            "UPDATE subscription_messages
             SET status = 'failed', available_at = NULL, error_stack = $3
             WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing'",
        )
        .bind(subscription.id)
        .bind(message_id)
        .bind(error)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query(
            "UPDATE subscription_messages
             SET status = 'waiting', available_at = $3, error_stack = $4
             WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing'",
        )
        .bind(subscription.id)
        .bind(message_id)
        .bind(Utc::now() + retry_delay(subscription, attempts))
        .bind(error)
        .execute(&mut *tx)
        .await?;
    }
    if subscription.consumption_mode == ConsumptionMode::Sequential {
        clear_gate(&mut tx, subscription.id).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Force a `failed` row back to `waiting`. Leaves `attempts` untouched: a
/// row whose attempts already reached the cap fails again after a single
/// further attempt.
pub(crate) async fn retry(db: &PgPool, subscription_id: Uuid, message_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE subscription_messages
         SET status = 'waiting', available_at = NULL, error_stack = NULL
         WHERE subscription_id = $1 AND message_id = $2 AND status = 'failed'",
    )
    .bind(subscription_id)
    .bind(message_id)
    .execute(db)
    .await?;
    Ok(())
}

pub(crate) async fn record_heartbeat(
    db: &PgPool,
    subscription_id: Uuid,
    message_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE subscription_messages SET last_heartbeat_at = $3
         WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing'",
    )
    .bind(subscription_id)
    .bind(message_id)
    .bind(Utc::now())
    .execute(db)
    .await?;
    Ok(())
}

pub(crate) async fn update_progress(
    db: &PgPool,
    subscription_id: Uuid,
    message_id: Uuid,
    progress: &Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE subscription_messages SET progress = $3
         WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing'",
    )
    .bind(subscription_id)
    .bind(message_id)
    .bind(progress)
    .execute(db)
    .await?;
    Ok(())
}

async fn clear_gate(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, subscription_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET processing = FALSE WHERE id = $1")
        .bind(subscription_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn retry_delay(subscription: &SubscriptionRecord, attempts: i32) -> chrono::Duration {
    let ms = match subscription.retry_strategy {
        RetryStrategy::Linear => subscription.retry_delay_ms,
        RetryStrategy::Exponential => {
            let exponent = (attempts - 1).clamp(0, 32) as u32;
            subscription.retry_delay_ms.saturating_mul(1_i64 << exponent)
        }
    };
    chrono::Duration::milliseconds(ms)
}
