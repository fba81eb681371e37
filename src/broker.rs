use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sqlx::postgres::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::consumer::Consumer;
use crate::database;
use crate::error::Result;
use crate::events::BrokerEvent;
use crate::maintenance;
use crate::models::{ordered_uuid, BrokerOptions, Retention, TopicOptions};
use crate::scheduler;
use crate::topic::Topic;

/// The broker: one database pool, the topic registry and the background
/// sweeps (retention trim, stale recovery, cron scheduling).
///
/// Cloning yields another handle onto the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) db: PgPool,
    pub(crate) options: BrokerOptions,
    pub(crate) event_tx: broadcast::Sender<BrokerEvent>,
    pub(crate) consumers: Mutex<Vec<Consumer>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Broker {
    /// Connect to the database, bootstrap the schema and start the
    /// background sweeps.
    pub async fn open(url: &str, options: BrokerOptions) -> Result<Broker> {
        let pool = database::connect(url).await?;
        Self::with_pool(pool, options).await
    }

    /// Same as `open`, on an existing pool.
    pub async fn with_pool(db: PgPool, options: BrokerOptions) -> Result<Broker> {
        database::ensure_schema(&db).await?;

        let (event_tx, _) = broadcast::channel(1024);
        let broker = Broker {
            inner: Arc::new(BrokerInner {
                db,
                options,
                event_tx,
                consumers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        broker.spawn_workers();
        Ok(broker)
    }

    // One independent interval task per sweep; a failing sweep logs and
    // waits for its next tick without affecting the others.
    fn spawn_workers(&self) {
        let mut workers = self.inner.workers.lock().unwrap();

        let broker = self.clone();
        let every = self.inner.options.trim_interval;
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Wait for the first interval before running.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = broker.trim().await {
                    error!("retention trim failed: {e}");
                }
            }
        }));

        let broker = self.clone();
        let every = self.inner.options.reset_stale_interval;
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = broker.reset_stale().await {
                    error!("stale sweep failed: {e}");
                }
            }
        }));

        let broker = self.clone();
        let every = self.inner.options.scheduled_interval;
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = broker.process_scheduled().await {
                    error!("scheduled sweep failed: {e}");
                }
            }
        }));
    }

    /// Broker-wide event stream (stale sweeps, config conflicts).
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Look up or lazily create a topic. An existing topic keeps its stored
    /// retention policy.
    pub async fn topic(&self, name: &str, options: TopicOptions) -> Result<Topic> {
        sqlx::query(
            "INSERT INTO topics (id, name, max_retention, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(ordered_uuid())
        .bind(name)
        .bind(options.max_retention.as_db())
        .bind(Utc::now())
        .execute(&self.inner.db)
        .await?;

        let (id, name, max_retention): (Uuid, String, Option<i64>) =
            sqlx::query_as("SELECT id, name, max_retention FROM topics WHERE name = $1")
                .bind(name)
                .fetch_one(&self.inner.db)
                .await?;
        let retention = match max_retention {
            None => Retention::Unlimited,
            Some(n) => Retention::Last(n.clamp(0, i64::from(u32::MAX)) as u32),
        };
        Ok(Topic::new(Arc::clone(&self.inner), id, name, retention))
    }

    /// Topic listing backing the retention trimmer.
    pub(crate) async fn topics(&self) -> Result<Vec<(Uuid, String, Option<i64>)>> {
        let topics = sqlx::query_as("SELECT id, name, max_retention FROM topics")
            .fetch_all(&self.inner.db)
            .await?;
        Ok(topics)
    }

    /// Run the retention trimmer once, across every topic with a bounded
    /// retention. Returns the number of deleted messages.
    pub async fn trim(&self) -> Result<u64> {
        let mut total = 0;
        for (id, name, max_retention) in self.topics().await? {
            let Some(keep) = max_retention else {
                continue; // unlimited retention
            };
            let deleted = maintenance::trim_topic(&self.inner.db, id, keep).await?;
            if deleted > 0 {
                info!("trimmed {deleted} messages from topic {name}");
            }
            total += deleted;
        }
        Ok(total)
    }

    /// Run the stale sweep once. Returns the number of swept rows.
    pub async fn reset_stale(&self) -> Result<u64> {
        maintenance::reset_stale(
            &self.inner.db,
            self.inner.options.stale_timeout,
            &self.inner.event_tx,
        )
        .await
    }

    /// Materialize every due scheduled message once. Returns the number of
    /// fired schedules.
    pub async fn process_scheduled(&self) -> Result<u64> {
        scheduler::process_scheduled(&self.inner.db).await
    }

    /// Stop the sweeps and every registered consumer (letting in-flight
    /// handlers finish), then close the pool. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().unwrap().drain(..).collect();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        let consumers: Vec<Consumer> = self.inner.consumers.lock().unwrap().drain(..).collect();
        for consumer in consumers {
            consumer.stop().await;
        }
        self.inner.db.close().await;
        info!("broker closed");
    }
}
