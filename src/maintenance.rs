// Background sweeps: stale-message recovery and retention trimming. Both
// commit in short transactions and are safe to run from any process.
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::events::BrokerEvent;
use crate::models::MessageStatus;

/// Sweep `processing` rows whose heartbeat lapsed. First lapse re-opens the
/// row, the second fails it for good. Sequential gates of the affected
/// subscriptions are released in the same transaction, which is the
/// recovery path for a process that crashed mid-delivery.
pub(crate) async fn reset_stale(
    db: &PgPool,
    stale_timeout: Duration,
    event_tx: &broadcast::Sender<BrokerEvent>,
) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(stale_timeout.as_millis() as i64);

    let mut tx = db.begin().await?;
    let swept: Vec<(Uuid, Uuid, MessageStatus)> = sqlx::query_as(
        "UPDATE subscription_messages
         SET status = CASE WHEN stale_count = 0
                           THEN 'waiting'::message_status
                           ELSE 'failed'::message_status END,
             stale_count = stale_count + 1,
             last_heartbeat_at = NULL
         WHERE status = 'processing' AND last_heartbeat_at <= $1
         RETURNING subscription_id, message_id, status",
    )
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await?;

    if !swept.is_empty() {
        let subscription_ids: Vec<Uuid> = swept.iter().map(|(s, _, _)| *s).collect();
        sqlx::query("UPDATE subscriptions SET processing = FALSE WHERE id = ANY($1)")
            .bind(&subscription_ids)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    for (subscription_id, message_id, status) in &swept {
        let _ = event_tx.send(BrokerEvent::Stale {
            subscription_id: *subscription_id,
            message_id: *message_id,
            status: *status,
        });
    }
    Ok(swept.len() as u64)
}

/// Delete acknowledged messages beyond the topic's retention cap, never
/// touching anything at or past the earliest unacknowledged message.
pub(crate) async fn trim_topic(db: &PgPool, topic_id: Uuid, keep: i64) -> Result<u64> {
    let mut tx = db.begin().await?;

    // Earliest message some subscription has not completed. NULL means all
    // messages are acknowledged (or the topic has no subscriptions).
    let (earliest_open,): (Option<Uuid>,) = sqlx::query_as(
        "SELECT min(sm.message_id)
         FROM subscription_messages sm
         JOIN subscriptions s ON s.id = sm.subscription_id
         WHERE s.topic_id = $1 AND sm.status <> 'completed'",
    )
    .bind(topic_id)
    .fetch_one(&mut *tx)
    .await?;

    // High-water mark: the (keep+1)-th newest acknowledged message. Nothing
    // to trim if fewer than keep+1 acknowledged messages exist.
    let mark: Option<(Uuid,)> = sqlx::query_as(
        "SELECT m.id FROM messages m
         WHERE m.topic_id = $1 AND ($2::uuid IS NULL OR m.id < $2)
         ORDER BY m.id DESC
         OFFSET $3 LIMIT 1",
    )
    .bind(topic_id)
    .bind(earliest_open)
    .bind(keep)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((mark,)) = mark else {
        return Ok(0);
    };

    let result = sqlx::query("DELETE FROM messages WHERE topic_id = $1 AND id <= $2")
        .bind(topic_id)
        .bind(mark)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
