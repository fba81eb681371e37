use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde_json::Value;
use uuid::Uuid;

use crate::broker::BrokerInner;
use crate::error::Result;
use crate::models::{
    ordered_uuid, Message, PublishOptions, Retention, ScheduleOptions, ScheduledMessage,
    SubscribeOptions,
};
use crate::subscription::{self, Subscription};

/// Handle onto one topic. Cheap to clone.
#[derive(Clone)]
pub struct Topic {
    broker: Arc<BrokerInner>,
    id: Uuid,
    name: String,
    max_retention: Retention,
}

impl Topic {
    pub(crate) fn new(
        broker: Arc<BrokerInner>,
        id: Uuid,
        name: String,
        max_retention: Retention,
    ) -> Self {
        Self {
            broker,
            id,
            name,
            max_retention,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retention(&self) -> Retention {
        self.max_retention
    }

    /// Send one message.
    pub async fn send(&self, payload: Value, options: PublishOptions) -> Result<Message> {
        let mut sent = self.send_bulk(vec![payload], options).await?;
        Ok(sent.remove(0))
    }

    /// Send a batch. The whole batch and its fan-out commit atomically, and
    /// message ids preserve the array order.
    pub async fn send_bulk(
        &self,
        payloads: Vec<Value>,
        options: PublishOptions,
    ) -> Result<Vec<Message>> {
        let mut tx = self.broker.db.begin().await?;
        let messages = insert_batch(&mut tx, self.id, payloads, &options, Utc::now()).await?;
        tx.commit().await?;
        Ok(messages)
    }

    /// Create or update the cron-driven message named `name`. Updating an
    /// existing schedule keeps its fired-occurrence counter.
    ///
    /// Returns a cron error synchronously when the expression is invalid.
    pub async fn schedule(
        &self,
        name: &str,
        cron: &str,
        payload: Value,
        options: ScheduleOptions,
    ) -> Result<ScheduledMessage> {
        let schedule = Cron::from_str(cron)?;
        let now = Utc::now();
        let next_occurrence_at = schedule.find_next_occurrence(&now, false)?;

        let row: ScheduledMessage = sqlx::query_as(
            "INSERT INTO scheduled_messages
                 (id, topic_id, name, payload, cron, next_occurrence_at,
                  deliver_in_ms, deliver_at, priority, repeats, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (topic_id, name) DO UPDATE SET
                 payload = EXCLUDED.payload,
                 cron = EXCLUDED.cron,
                 next_occurrence_at = EXCLUDED.next_occurrence_at,
                 deliver_in_ms = EXCLUDED.deliver_in_ms,
                 deliver_at = EXCLUDED.deliver_at,
                 priority = EXCLUDED.priority,
                 repeats = EXCLUDED.repeats
             RETURNING *",
        )
        .bind(ordered_uuid())
        .bind(self.id)
        .bind(name)
        .bind(payload)
        .bind(cron)
        .bind(next_occurrence_at)
        .bind(options.publish.deliver_in.map(|d| d.as_millis() as i64))
        .bind(options.publish.deliver_at)
        .bind(options.publish.priority)
        .bind(options.repeats)
        .bind(now)
        .fetch_one(&self.broker.db)
        .await?;
        Ok(row)
    }

    /// Create the subscription if absent, otherwise return the stored one.
    pub async fn subscribe(&self, name: &str, options: SubscribeOptions) -> Result<Subscription> {
        subscription::subscribe(Arc::clone(&self.broker), self.id, name, options).await
    }

    /// Delete every message in the topic, cascading to the per-subscription
    /// rows. Scheduled message definitions survive.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE topic_id = $1")
            .bind(self.id)
            .execute(&self.broker.db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_messages(&self) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE topic_id = $1 ORDER BY id",
        )
        .bind(self.id)
        .fetch_all(&self.broker.db)
        .await?;
        Ok(messages)
    }

    pub async fn get_scheduled_messages(&self) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, ScheduledMessage>(
            "SELECT * FROM scheduled_messages WHERE topic_id = $1 ORDER BY name",
        )
        .bind(self.id)
        .fetch_all(&self.broker.db)
        .await?;
        Ok(rows)
    }
}

/// Insert a batch of messages and fan them out to every current
/// subscription of the topic, all on the caller's transaction. Ids are
/// generated in array order, so id order equals send order.
pub(crate) async fn insert_batch(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    topic_id: Uuid,
    payloads: Vec<Value>,
    options: &PublishOptions,
    now: DateTime<Utc>,
) -> Result<Vec<Message>> {
    let deliver_at = options.resolve_deliver_at(now);
    let mut messages = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let message = Message {
            id: ordered_uuid(),
            topic_id,
            payload,
            deliver_at,
            priority: options.priority,
            created_at: now,
        };
        sqlx::query(
            "INSERT INTO messages (id, topic_id, payload, deliver_at, priority, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(message.topic_id)
        .bind(&message.payload)
        .bind(message.deliver_at)
        .bind(message.priority)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;
        messages.push(message);
    }

    // One row per (new message x existing subscription). Committing this
    // together with the inserts above is what makes fan-out atomic.
    let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
    sqlx::query(
        "INSERT INTO subscription_messages (subscription_id, message_id, available_at)
         SELECT s.id, m.id, m.deliver_at
         FROM subscriptions s, messages m
         WHERE s.topic_id = $1 AND m.id = ANY($2)",
    )
    .bind(topic_id)
    .bind(&ids)
    .execute(&mut **tx)
    .await?;

    Ok(messages)
}
