//! Postgres-backed messaging broker.
//!
//! Three messaging shapes behind one API — job queues, strictly ordered
//! event logs and pub/sub fan-out — with the database as the only moving
//! part. Every coordination decision (reservation, retry, stale recovery,
//! retention, cron firing) is a committed transaction, so any number of
//! processes can share the same topics without an external broker.
//!
//! ```no_run
//! use pgbus::{Broker, BrokerOptions, ConsumerOptions, PublishOptions, SubscribeOptions, TopicOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> pgbus::Result<()> {
//! let broker = Broker::open("postgres://localhost/bus", BrokerOptions::default()).await?;
//! let orders = broker.topic("orders", TopicOptions::default()).await?;
//! let subscription = orders.subscribe("mailer", SubscribeOptions::default()).await?;
//!
//! subscription.consume(
//!     |delivery| async move {
//!         println!("order: {}", delivery.payload());
//!         Ok(())
//!     },
//!     ConsumerOptions::default(),
//! )?;
//!
//! orders.send(json!({ "order_id": 42 }), PublishOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod consumer;
mod database;
mod error;
mod events;
mod maintenance;
mod models;
mod reservation;
mod scheduler;
mod subscription;
mod topic;

pub use broker::Broker;
pub use consumer::{Consumer, Delivery, HandlerError};
pub use error::{Error, Result};
pub use events::{BrokerEvent, ConsumerEvent};
pub use models::{
    BrokerOptions, ConsumerOptions, ConsumptionMode, Message, MessageStatus, PublishOptions,
    Retention, RetryStrategy, ScheduleOptions, ScheduledMessage, StartPosition, SubscribeOptions,
    SubscriptionMessage, TopicOptions,
};
pub use subscription::Subscription;
pub use topic::Topic;
