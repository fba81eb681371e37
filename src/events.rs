// In-process events. Fire-and-forget: senders never wait for listeners and
// a send with no subscriber is silently dropped.
use serde_json::Value;
use uuid::Uuid;

use crate::models::MessageStatus;

/// Broker-wide events, observed through `Broker::events`.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A processing row whose heartbeat lapsed was swept: re-opened on its
    /// first lapse, failed on the second.
    Stale {
        subscription_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    },
    /// `subscribe` was called with options diverging from the stored
    /// configuration; the stored configuration stays in force.
    ConfigConflict {
        subscription_id: Uuid,
        topic_id: Uuid,
        name: String,
    },
}

/// Per-consumer events, observed through `Consumer::events`.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A message was handed to the handler.
    Process { message_id: Uuid, attempts: i32 },
    Completed { message_id: Uuid },
    Failed { message_id: Uuid, error: String },
    /// Forwarded from `Delivery::update_progress`.
    Progress { message_id: Uuid, progress: Value },
    /// A reservation returned this many messages.
    Consume { reserved: usize },
    /// A drain finished with nothing in flight.
    Idle,
}
