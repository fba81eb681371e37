// Shared helpers for the integration suite. Each test gets its own
// database from the sqlx test harness; the broker bootstraps its schema on
// open. Background sweeps are configured far apart so tests drive trim,
// stale recovery and scheduling explicitly.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use pgbus::{Broker, BrokerOptions};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn broker(pool: PgPool) -> Broker {
    broker_with(pool, quiet_options()).await
}

pub async fn broker_with(pool: PgPool, options: BrokerOptions) -> Broker {
    // Tests run in one process; only the first call installs the subscriber.
    let _ = tracing_subscriber::fmt::try_init();
    Broker::with_pool(pool, options)
        .await
        .expect("open broker on test pool")
}

/// Sweeps effectively disabled; tests invoke them directly.
pub fn quiet_options() -> BrokerOptions {
    BrokerOptions {
        trim_interval: Duration::from_secs(3_600),
        reset_stale_interval: Duration::from_secs(3_600),
        scheduled_interval: Duration::from_secs(3_600),
        ..BrokerOptions::default()
    }
}

/// Quiet sweeps with an immediately-lapsing heartbeat window.
pub fn instant_stale_options() -> BrokerOptions {
    BrokerOptions {
        stale_timeout: Duration::from_millis(1),
        ..quiet_options()
    }
}

pub async fn status_count(pool: &PgPool, subscription_id: Uuid, status: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT count(*) FROM subscription_messages
         WHERE subscription_id = $1 AND status::text = $2",
    )
    .bind(subscription_id)
    .bind(status)
    .fetch_one(pool)
    .await
    .expect("count subscription messages")
}

pub async fn message_count(pool: &PgPool, topic_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM messages WHERE topic_id = $1")
        .bind(topic_id)
        .fetch_one(pool)
        .await
        .expect("count messages")
}

/// Make every pending delivery of the subscription due now.
pub async fn make_available(pool: &PgPool, subscription_id: Uuid) {
    sqlx::query(
        "UPDATE subscription_messages SET available_at = now() - interval '1 second'
         WHERE subscription_id = $1 AND available_at IS NOT NULL",
    )
    .bind(subscription_id)
    .execute(pool)
    .await
    .expect("rewrite available_at");
}

/// Pull a scheduled message's next occurrence into the past.
pub async fn make_schedule_due(pool: &PgPool, topic_id: Uuid, name: &str) {
    sqlx::query(
        "UPDATE scheduled_messages SET next_occurrence_at = now() - interval '1 second'
         WHERE topic_id = $1 AND name = $2",
    )
    .bind(topic_id)
    .bind(name)
    .execute(pool)
    .await
    .expect("rewrite next_occurrence_at");
}

/// Poll until `check` passes or a few seconds elapse.
pub async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}
