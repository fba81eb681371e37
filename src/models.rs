// Row types, status enums and option structs shared across the crate.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-subscription delivery state of a message.
///
/// The enum values are part of the store contract: they are the
/// `message_status` database enum consumed by `get_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Waiting => "waiting",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }
}

/// How a subscription hands messages to its consumers.
///
/// `Sequential` delivers one message at a time across every consumer and
/// every process; `Parallel` lets consumers reserve batches concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionMode {
    Sequential,
    Parallel,
}

/// Which messages a new subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Backfill every message already in the topic.
    Earliest,
    /// Only messages sent after the subscription was created.
    Latest,
}

/// How the retry delay grows across failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Per-topic retention policy: how many acknowledged messages to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Unlimited,
    Last(u32),
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Last(0)
    }
}

impl Retention {
    pub(crate) fn as_db(self) -> Option<i64> {
        match self {
            Retention::Unlimited => None,
            Retention::Last(n) => Some(i64::from(n)),
        }
    }
}

/// A message stored in a topic. Immutable once inserted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    /// Time-ordered id; id order is the topic's canonical send order.
    pub id: Uuid,
    pub topic_id: Uuid,
    pub payload: Value,
    /// Gates visibility: the message is not reservable before this instant.
    pub deliver_at: Option<DateTime<Utc>>,
    /// Lower number reserves first; NULL sorts last.
    pub priority: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// A cron-driven message definition, keyed by `(topic, name)`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub cron: String,
    pub next_occurrence_at: DateTime<Utc>,
    pub deliver_in_ms: Option<i64>,
    pub deliver_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub repeats: Option<i64>,
    pub repeats_made: i64,
    pub created_at: DateTime<Utc>,
}

/// Delivery state of one message under one subscription, joined with its
/// payload. Returned by `Subscription::get_messages`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionMessage {
    pub subscription_id: Uuid,
    pub message_id: Uuid,
    pub status: MessageStatus,
    pub attempts: i32,
    pub available_at: Option<DateTime<Utc>>,
    pub error_stack: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub progress: Option<Value>,
    pub stale_count: i32,
    pub payload: Value,
}

/// The stored configuration of a subscription.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SubscriptionRecord {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub consumption_mode: ConsumptionMode,
    pub start_position: StartPosition,
    pub max_attempts: i32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay_ms: i64,
    pub processing: bool,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub(crate) fn differs_from(&self, options: &SubscribeOptions) -> bool {
        self.consumption_mode != options.consumption_mode
            || self.start_position != options.start_position
            || self.max_attempts != options.max_attempts
            || self.retry_strategy != options.retry_strategy
            || self.retry_delay_ms != options.retry_delay.as_millis() as i64
    }
}

/// Broker tunables for the background sweeps.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub trim_interval: Duration,
    /// A processing message whose heartbeat is older than this is stale.
    pub stale_timeout: Duration,
    pub reset_stale_interval: Duration,
    pub scheduled_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            trim_interval: Duration::from_millis(60_000),
            stale_timeout: Duration::from_millis(60_000),
            reset_stale_interval: Duration::from_millis(60_000),
            scheduled_interval: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    pub max_retention: Retention,
}

/// Options applying to a `send`/`send_bulk` call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Absolute delivery time. Wins over `deliver_in`.
    pub deliver_at: Option<DateTime<Utc>>,
    /// Delivery delay relative to the send.
    pub deliver_in: Option<Duration>,
    /// Lower number reserves first; unset sorts last.
    pub priority: Option<i32>,
}

impl PublishOptions {
    pub(crate) fn resolve_deliver_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.deliver_at.or_else(|| {
            self.deliver_in
                .map(|d| now + chrono::Duration::milliseconds(d.as_millis() as i64))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Stop firing after this many occurrences. Unset fires forever.
    pub repeats: Option<i64>,
    /// Inherited by every materialized message.
    pub publish: PublishOptions,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub consumption_mode: ConsumptionMode,
    pub start_position: StartPosition,
    pub max_attempts: i32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumption_mode: ConsumptionMode::Sequential,
            start_position: StartPosition::Latest,
            max_attempts: 1,
            retry_strategy: RetryStrategy::Linear,
            retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Concurrency budget. Forced to 1 on sequential subscriptions.
    pub concurrency: usize,
    pub polling_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Start the poll loop as soon as the consumer is created.
    pub autostart: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            polling_interval: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_millis(10_000),
            autostart: true,
        }
    }
}

/// Time-ordered message id. The process-wide context keeps ids strictly
/// increasing within a batch generated on this host.
pub(crate) fn ordered_uuid() -> Uuid {
    Uuid::now_v7()
}
