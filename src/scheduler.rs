// Materializes cron-driven scheduled messages into concrete messages.
use std::str::FromStr;

use chrono::Utc;
use croner::Cron;
use sqlx::postgres::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::models::{PublishOptions, ScheduledMessage};
use crate::topic;

/// Fire every due schedule once: insert the concrete message through the
/// writer, advance `next_occurrence_at` past the stored occurrence and
/// count the repeat, all in one transaction. A rollback leaves the rows
/// due, so firing is at-least-once per occurrence.
///
/// Due rows are claimed with `SKIP LOCKED`, so concurrent sweeps split the
/// work instead of double-firing.
pub(crate) async fn process_scheduled(db: &PgPool) -> Result<u64> {
    let now = Utc::now();
    let mut tx = db.begin().await?;

    let due: Vec<ScheduledMessage> = sqlx::query_as(
        "SELECT * FROM scheduled_messages
         WHERE next_occurrence_at <= $1
           AND (repeats IS NULL OR repeats_made < repeats)
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let mut fired = 0;
    for schedule in &due {
        let options = PublishOptions {
            deliver_at: schedule.deliver_at,
            deliver_in: schedule
                .deliver_in_ms
                .map(|ms| std::time::Duration::from_millis(ms.max(0) as u64)),
            priority: schedule.priority,
        };
        topic::insert_batch(&mut tx, schedule.topic_id, vec![schedule.payload.clone()], &options, now)
            .await?;

        let next = Cron::from_str(&schedule.cron)?
            .find_next_occurrence(&schedule.next_occurrence_at, false)?;
        sqlx::query(
            "UPDATE scheduled_messages
             SET next_occurrence_at = $2, repeats_made = repeats_made + 1
             WHERE id = $1",
        )
        .bind(schedule.id)
        .bind(next)
        .execute(&mut *tx)
        .await?;

        debug!(
            "fired scheduled message '{}', next occurrence {next}",
            schedule.name
        );
        fired += 1;
    }

    tx.commit().await?;
    Ok(fired)
}
