// Background sweeps: stale-message recovery (second-chance policy, gate
// release) and retention trimming.
mod common;

use std::time::Duration;

use common::{broker, broker_with, eventually, instant_stale_options, message_count, status_count};
use pretty_assertions::assert_eq;
use pgbus::{
    BrokerEvent, ConsumerOptions, ConsumptionMode, MessageStatus, PublishOptions, Retention,
    SubscribeOptions, TopicOptions,
};
use serde_json::json;
use sqlx::PgPool;

fn manual() -> ConsumerOptions {
    ConsumerOptions {
        autostart: false,
        ..ConsumerOptions::default()
    }
}

async fn row_status(pool: &PgPool, subscription_id: uuid::Uuid) -> (String, i32, i32) {
    sqlx::query_as::<_, (String, i32, i32)>(
        "SELECT status::text, attempts, stale_count FROM subscription_messages
         WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .fetch_one(pool)
    .await
    .expect("fetch subscription message")
}

// Scenario: a lapsed heartbeat re-opens the row once; the second lapse
// fails it for good.
#[sqlx::test(migrations = false)]
async fn stale_message_gets_one_second_chance(pool: PgPool) {
    let broker = broker_with(pool.clone(), instant_stale_options()).await;
    let mut events = broker.events();
    let topic = broker.topic("orders", TopicOptions::default()).await.unwrap();
    let sub = topic
        .subscribe(
            "worker",
            SubscribeOptions {
                consumption_mode: ConsumptionMode::Parallel,
                ..SubscribeOptions::default()
            },
        )
        .await
        .unwrap();

    topic.send(json!("slow"), PublishOptions::default()).await.unwrap();

    // The handler outlives the (1ms) stale window on every attempt.
    let consumer = sub
        .consume(
            |_delivery| async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            },
            manual(),
        )
        .unwrap();
    let drain = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.consume().await })
    };

    // First lapse: back to waiting with one strike.
    eventually(
        || {
            let pool = pool.clone();
            let id = sub.id();
            async move { status_count(&pool, id, "processing").await == 1 }
        },
        "first reservation",
    )
    .await;
    assert_eq!(broker.reset_stale().await.unwrap(), 1);
    let (status, _, stale_count) = row_status(&pool, sub.id()).await;
    assert_eq!((status.as_str(), stale_count), ("waiting", 1));

    // The drain re-reserves the re-opened row; the second lapse is final.
    eventually(
        || {
            let pool = pool.clone();
            let id = sub.id();
            async move { status_count(&pool, id, "processing").await == 1 }
        },
        "second reservation",
    )
    .await;
    assert_eq!(broker.reset_stale().await.unwrap(), 1);
    let (status, attempts, stale_count) = row_status(&pool, sub.id()).await;
    assert_eq!((status.as_str(), attempts, stale_count), ("failed", 2, 2));

    drain.await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(BrokerEvent::Stale { status, .. }) = events.try_recv() {
        statuses.push(status);
    }
    assert_eq!(statuses, vec![MessageStatus::Waiting, MessageStatus::Failed]);
}

// The stale sweep is the recovery path for a sequential gate left raised
// by a crashed or wedged consumer.
#[sqlx::test(migrations = false)]
async fn stale_sweep_releases_the_sequential_gate(pool: PgPool) {
    let broker = broker_with(pool.clone(), instant_stale_options()).await;
    let topic = broker.topic("orders", TopicOptions::default()).await.unwrap();
    let sub = topic.subscribe("worker", SubscribeOptions::default()).await.unwrap();

    topic.send(json!("slow"), PublishOptions::default()).await.unwrap();
    let consumer = sub
        .consume(
            |_delivery| async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            },
            manual(),
        )
        .unwrap();
    let drain = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.consume().await })
    };

    let gate = || async {
        sqlx::query_scalar::<_, bool>("SELECT processing FROM subscriptions WHERE id = $1")
            .bind(sub.id())
            .fetch_one(&pool)
            .await
            .unwrap()
    };

    eventually(
        || {
            let pool = pool.clone();
            let id = sub.id();
            async move { status_count(&pool, id, "processing").await == 1 }
        },
        "reservation in flight",
    )
    .await;
    assert!(gate().await, "gate raised while in flight");

    broker.reset_stale().await.unwrap();
    assert!(!gate().await, "sweep released the gate");

    drain.await.unwrap();
    // Second chance: the re-reservation ran to completion afterwards.
    let (status, attempts, stale_count) = row_status(&pool, sub.id()).await;
    assert_eq!((status.as_str(), attempts, stale_count), ("completed", 2, 1));
    assert!(!gate().await);
}

// Scenario: retention 1 keeps the newest acknowledged message and
// everything unacknowledged.
#[sqlx::test(migrations = false)]
async fn trim_keeps_retained_and_unacknowledged_messages(pool: PgPool) {
    let broker = broker(pool.clone()).await;
    let topic = broker
        .topic(
            "orders",
            TopicOptions {
                max_retention: Retention::Last(1),
            },
        )
        .await
        .unwrap();
    let sub = topic.subscribe("worker", SubscribeOptions::default()).await.unwrap();

    topic
        .send_bulk(vec![json!("m1"), json!("m2")], PublishOptions::default())
        .await
        .unwrap();
    let consumer = sub
        .consume(|_delivery| async move { Ok(()) }, manual())
        .unwrap();
    consumer.consume().await;
    assert_eq!(status_count(&pool, sub.id(), "completed").await, 2);

    topic.send(json!("m3"), PublishOptions::default()).await.unwrap();

    assert_eq!(broker.trim().await.unwrap(), 1);
    let remaining: Vec<_> = topic
        .get_messages()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(remaining, vec![json!("m2"), json!("m3")]);
}

#[sqlx::test(migrations = false)]
async fn trim_skips_unlimited_topics(pool: PgPool) {
    let broker = broker(pool.clone()).await;
    let topic = broker
        .topic(
            "orders",
            TopicOptions {
                max_retention: Retention::Unlimited,
            },
        )
        .await
        .unwrap();
    let sub = topic.subscribe("worker", SubscribeOptions::default()).await.unwrap();

    topic
        .send_bulk(vec![json!(1), json!(2), json!(3)], PublishOptions::default())
        .await
        .unwrap();
    let consumer = sub
        .consume(|_delivery| async move { Ok(()) }, manual())
        .unwrap();
    consumer.consume().await;

    assert_eq!(broker.trim().await.unwrap(), 0);
    assert_eq!(message_count(&pool, topic.id()).await, 3);
}

// Without subscriptions every message counts as acknowledged, so a zero
// retention empties the topic.
#[sqlx::test(migrations = false)]
async fn trim_drops_everything_on_a_subscriberless_topic(pool: PgPool) {
    let broker = broker(pool.clone()).await;
    let topic = broker.topic("orders", TopicOptions::default()).await.unwrap();

    topic
        .send_bulk(vec![json!(1), json!(2), json!(3)], PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(broker.trim().await.unwrap(), 3);
    assert_eq!(message_count(&pool, topic.id()).await, 0);
}

#[sqlx::test(migrations = false)]
async fn trim_never_deletes_unacknowledged_messages(pool: PgPool) {
    let broker = broker(pool.clone()).await;
    let topic = broker.topic("orders", TopicOptions::default()).await.unwrap();
    let sub = topic.subscribe("worker", SubscribeOptions::default()).await.unwrap();

    topic
        .send_bulk(vec![json!(1), json!(2), json!(3)], PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(status_count(&pool, sub.id(), "waiting").await, 3);

    // Zero retention, yet nothing is acknowledged: nothing to delete.
    assert_eq!(broker.trim().await.unwrap(), 0);
    assert_eq!(message_count(&pool, topic.id()).await, 3);
}
