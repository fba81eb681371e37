// Consumer runtime: a cooperative poll loop that drains a subscription
// through its handler while keeping a concurrency budget and a heartbeat
// per in-flight message.
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use sqlx::postgres::PgPool;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::ConsumerEvent;
use crate::models::{ConsumerOptions, ConsumptionMode, Message, SubscriptionRecord};
use crate::reservation::{self, ReservedMessage};

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// A reserved message as seen from inside a handler.
pub struct Delivery {
    pub message: Message,
    /// Attempt counter for this delivery, 1-based.
    pub attempts: i32,
    subscription_id: Uuid,
    db: PgPool,
    events: broadcast::Sender<ConsumerEvent>,
}

impl Delivery {
    pub fn payload(&self) -> &Value {
        &self.message.payload
    }

    /// Persist handler progress and notify event listeners. Progress is
    /// cleared again on every reservation.
    pub async fn update_progress(&self, progress: Value) -> Result<()> {
        reservation::update_progress(&self.db, self.subscription_id, self.message.id, &progress)
            .await?;
        let _ = self.events.send(ConsumerEvent::Progress {
            message_id: self.message.id,
            progress,
        });
        Ok(())
    }
}

/// A handler bound to a subscription.
///
/// Cloning yields another handle onto the same runtime.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    db: PgPool,
    subscription: SubscriptionRecord,
    handler: Handler,
    options: ConsumerOptions,
    event_tx: broadcast::Sender<ConsumerEvent>,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    // Set when a consume() call joins an active drain; makes the drain
    // re-check for work before going idle.
    rescan: AtomicBool,
    slot_freed: Notify,
    idle: Notify,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    stop_signal: Notify,
}

impl Consumer {
    pub(crate) fn new<F, Fut>(
        db: PgPool,
        subscription: SubscriptionRecord,
        handler: F,
        mut options: ConsumerOptions,
    ) -> Consumer
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        if subscription.consumption_mode == ConsumptionMode::Sequential {
            options.concurrency = 1;
        }
        options.concurrency = options.concurrency.max(1);
        let handler: Handler = Arc::new(move |delivery| handler(delivery).boxed());
        let (event_tx, _) = broadcast::channel(1024);

        Consumer {
            inner: Arc::new(ConsumerInner {
                db,
                subscription,
                handler,
                options,
                event_tx,
                in_flight: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                rescan: AtomicBool::new(false),
                slot_freed: Notify::new(),
                idle: Notify::new(),
                poll_task: Mutex::new(None),
                stopping: AtomicBool::new(false),
                stop_signal: Notify::new(),
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Begin polling. A second call while polling is a no-op.
    pub fn start(&self) {
        let mut guard = self.inner.poll_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        let consumer = self.clone();
        let every = self.inner.options.polling_interval;
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                if consumer.inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = consumer.inner.stop_signal.notified() => break,
                }
                if consumer.inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                // Never cancelled mid-flight: stop() only interrupts the
                // wait for the next tick, not a running drain.
                consumer.consume().await;
            }
        }));
    }

    /// End the poll loop and wait for the current drain to settle.
    /// In-flight handlers run to completion.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
        let task = self.inner.poll_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.wait_idle().await;
    }

    /// One explicit drain. Coalescing: a call made while a drain is in
    /// progress joins it instead of starting another.
    pub async fn consume(&self) {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            self.inner.rescan.store(true, Ordering::SeqCst);
            self.wait_idle().await;
            return;
        }
        self.drain().await;
        self.inner.draining.store(false, Ordering::SeqCst);
        let _ = self.inner.event_tx.send(ConsumerEvent::Idle);
        self.inner.idle.notify_waiters();
    }

    /// Resolves when no drain is running and nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.inner.draining.load(Ordering::SeqCst)
                && self.inner.in_flight.load(Ordering::SeqCst) == 0
            {
                return;
            }
            notified.await;
        }
    }

    async fn drain(&self) {
        let budget = self.inner.options.concurrency;
        loop {
            let free = budget.saturating_sub(self.inner.in_flight.load(Ordering::SeqCst));
            if free == 0 {
                self.wait_for_capacity().await;
                continue;
            }
            match reservation::reserve_next(&self.inner.db, &self.inner.subscription, free as i64)
                .await
            {
                Ok(batch) if !batch.is_empty() => {
                    let _ = self.inner.event_tx.send(ConsumerEvent::Consume {
                        reserved: batch.len(),
                    });
                    for reserved in batch {
                        self.dispatch(reserved);
                    }
                }
                Ok(_) => {
                    if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                        if self.inner.rescan.swap(false, Ordering::SeqCst) {
                            continue;
                        }
                        return;
                    }
                    // Nothing reservable right now; re-enter as soon as an
                    // in-flight handler finishes.
                    self.wait_for_completion().await;
                }
                Err(e) => {
                    // The next poll re-attempts the drain.
                    error!(
                        "reservation failed for subscription {}: {e}",
                        self.inner.subscription.name
                    );
                    return;
                }
            }
        }
    }

    async fn wait_for_capacity(&self) {
        loop {
            let notified = self.inner.slot_freed.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) < self.inner.options.concurrency {
                return;
            }
            notified.await;
        }
    }

    async fn wait_for_completion(&self) {
        let notified = self.inner.slot_freed.notified();
        if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
            return;
        }
        notified.await;
    }

    fn dispatch(&self, reserved: ReservedMessage) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.event_tx.send(ConsumerEvent::Process {
            message_id: reserved.message.id,
            attempts: reserved.attempts,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let message_id = reserved.message.id;
            let attempts = reserved.attempts;
            let heartbeat = spawn_heartbeat(&inner, message_id);

            let delivery = Delivery {
                message: reserved.message,
                attempts,
                subscription_id: inner.subscription.id,
                db: inner.db.clone(),
                events: inner.event_tx.clone(),
            };
            let outcome = AssertUnwindSafe((inner.handler)(delivery))
                .catch_unwind()
                .await;
            heartbeat.abort();

            // A panicking handler is a failed delivery, not a dead runtime.
            let result = match outcome {
                Ok(result) => result,
                Err(_) => Err(HandlerError::from("handler panicked")),
            };

            match result {
                Ok(()) => match reservation::complete(&inner.db, &inner.subscription, message_id)
                    .await
                {
                    Ok(()) => {
                        let _ = inner.event_tx.send(ConsumerEvent::Completed { message_id });
                    }
                    Err(e) => error!("completing message {message_id} failed: {e}"),
                },
                Err(err) => {
                    let error = err.to_string();
                    match reservation::fail(
                        &inner.db,
                        &inner.subscription,
                        message_id,
                        attempts,
                        &error,
                    )
                    .await
                    {
                        Ok(()) => {
                            let _ = inner.event_tx.send(ConsumerEvent::Failed { message_id, error });
                        }
                        Err(e) => error!("failing message {message_id} failed: {e}"),
                    }
                }
            }

            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            inner.slot_freed.notify_waiters();
            inner.idle.notify_waiters();
        });
    }
}

fn spawn_heartbeat(inner: &Arc<ConsumerInner>, message_id: Uuid) -> JoinHandle<()> {
    let db = inner.db.clone();
    let subscription_id = inner.subscription.id;
    let every = inner.options.heartbeat_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The reservation already stamped a heartbeat; skip the immediate tick.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = reservation::record_heartbeat(&db, subscription_id, message_id).await {
                warn!("heartbeat for message {message_id} failed: {e}");
            }
        }
    })
}
