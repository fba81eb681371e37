use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::broker::BrokerInner;
use crate::consumer::{Consumer, Delivery, HandlerError};
use crate::error::Result;
use crate::events::BrokerEvent;
use crate::models::{
    ordered_uuid, ConsumerOptions, MessageStatus, StartPosition, SubscribeOptions,
    SubscriptionMessage, SubscriptionRecord,
};
use crate::reservation;

/// Handle onto one subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    broker: Arc<BrokerInner>,
    record: SubscriptionRecord,
}

/// Create-or-return. A new `earliest` subscription backfills rows for every
/// message already in the topic inside the creation transaction, so the
/// database's MVCC snapshot decides whether a concurrent send is included.
pub(crate) async fn subscribe(
    broker: Arc<BrokerInner>,
    topic_id: Uuid,
    name: &str,
    options: SubscribeOptions,
) -> Result<Subscription> {
    let mut tx = broker.db.begin().await?;

    let inserted: Option<SubscriptionRecord> = sqlx::query_as(
        "INSERT INTO subscriptions
             (id, topic_id, name, consumption_mode, start_position,
              max_attempts, retry_strategy, retry_delay_ms, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (topic_id, name) DO NOTHING
         RETURNING *",
    )
    .bind(ordered_uuid())
    .bind(topic_id)
    .bind(name)
    .bind(options.consumption_mode)
    .bind(options.start_position)
    .bind(options.max_attempts)
    .bind(options.retry_strategy)
    .bind(options.retry_delay.as_millis() as i64)
    .bind(Utc::now())
    .fetch_optional(&mut *tx)
    .await?;

    let record = match inserted {
        Some(record) => {
            if record.start_position == StartPosition::Earliest {
                sqlx::query(
                    "INSERT INTO subscription_messages (subscription_id, message_id, available_at)
                     SELECT $1, m.id, m.deliver_at FROM messages m WHERE m.topic_id = $2",
                )
                .bind(record.id)
                .bind(topic_id)
                .execute(&mut *tx)
                .await?;
            }
            record
        }
        None => {
            let record: SubscriptionRecord =
                sqlx::query_as("SELECT * FROM subscriptions WHERE topic_id = $1 AND name = $2")
                    .bind(topic_id)
                    .bind(name)
                    .fetch_one(&mut *tx)
                    .await?;
            // Stored configuration wins; the divergence is surfaced as an
            // event and the subscription stays usable.
            if record.differs_from(&options) {
                warn!(
                    "subscribe options for '{name}' differ from the stored configuration; keeping stored"
                );
                let _ = broker.event_tx.send(BrokerEvent::ConfigConflict {
                    subscription_id: record.id,
                    topic_id,
                    name: name.to_string(),
                });
            }
            record
        }
    };

    tx.commit().await?;
    Ok(Subscription { broker, record })
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn topic_id(&self) -> Uuid {
        self.record.topic_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Bind a handler. The returned consumer polls on its own when
    /// `autostart` is set, and is stopped by `Broker::close`.
    pub fn consume<F, Fut>(&self, handler: F, options: ConsumerOptions) -> Result<Consumer>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let autostart = options.autostart;
        let consumer = Consumer::new(
            self.broker.db.clone(),
            self.record.clone(),
            handler,
            options,
        );
        self.broker
            .consumers
            .lock()
            .unwrap()
            .push(consumer.clone());
        if autostart {
            consumer.start();
        }
        Ok(consumer)
    }

    /// Delivery state rows, optionally filtered by status. An empty filter
    /// returns everything, in message order.
    pub async fn get_messages(&self, statuses: &[MessageStatus]) -> Result<Vec<SubscriptionMessage>> {
        let filter: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, SubscriptionMessage>(
            "SELECT sm.subscription_id, sm.message_id, sm.status, sm.attempts,
                    sm.available_at, sm.error_stack, sm.last_heartbeat_at,
                    sm.progress, sm.stale_count, m.payload
             FROM subscription_messages sm
             JOIN messages m ON m.id = sm.message_id
             WHERE sm.subscription_id = $1
               AND (cardinality($2::text[]) = 0 OR sm.status::text = ANY($2))
             ORDER BY m.id",
        )
        .bind(self.record.id)
        .bind(&filter)
        .fetch_all(&self.broker.db)
        .await?;
        Ok(rows)
    }

    /// Force a `failed` message back to `waiting`. Attempts are not reset:
    /// an exhausted row that fails once more returns to `failed`.
    pub async fn retry(&self, message_id: Uuid) -> Result<()> {
        reservation::retry(&self.broker.db, self.record.id, message_id).await
    }

    /// Drop the subscription and, by cascade, its delivery state.
    pub async fn remove(self) -> Result<()> {
        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(self.record.id)
            .execute(&self.broker.db)
            .await?;
        Ok(())
    }
}
