//! Pub/sub event broker.
//!
//! Each subscription owns a bounded mpsc channel; broadcast walks the
//! subscriber table and `try_send`s to every matching channel. A send that
//! fails for any reason, full or closed, drops the subscription: a consumer
//! that cannot keep up is disconnected rather than allowed to stall or
//! leak the broadcast path.

use dashmap::DashMap;
use meshlink_core::{encode_payload, pattern_matches, signature, EventNotification};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Subscription {
    client_id: String,
    pattern: String,
    tx: mpsc::Sender<EventNotification>,
}

/// Fan-out broker keyed by subscription id.
#[derive(Debug)]
pub struct EventBroker {
    subscribers: DashMap<Uuid, Subscription>,
    channel_capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBroker {
    #[must_use]
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            channel_capacity,
        }
    }

    /// Opens a subscription and returns its id plus the receiving end of
    /// its event channel. A caller-supplied id is honored; collisions
    /// replace the previous subscription.
    #[must_use]
    pub fn subscribe(
        &self,
        client_id: &str,
        pattern: &str,
        subscription_id: Option<Uuid>,
    ) -> (Uuid, mpsc::Receiver<EventNotification>) {
        let id = subscription_id.unwrap_or_else(Uuid::new_v4);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers.insert(
            id,
            Subscription {
                client_id: client_id.to_string(),
                pattern: pattern.to_string(),
                tx,
            },
        );
        info!(client_id, pattern, subscription_id = %id, "subscription opened");
        (id, rx)
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let removed = self.subscribers.remove(&subscription_id).is_some();
        if removed {
            info!(subscription_id = %subscription_id, "subscription closed");
        }
        removed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Broadcasts an event to every subscription whose pattern matches the
    /// event type. Returns the number of deliveries.
    pub fn broadcast(&self, event_type: &str, data: &Value) -> usize {
        let payload = match encode_payload(data) {
            Ok(payload) => payload,
            Err(err) => {
                error!(event_type, error = %err, "event payload not encodable");
                return 0;
            }
        };
        let event = EventNotification {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            data: payload,
            timestamp: signature::unix_timestamp(),
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in &self.subscribers {
            if !pattern_matches(event_type, &entry.pattern) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        subscription_id = %entry.key(),
                        client_id = %entry.client_id,
                        error = %err,
                        "dropping subscription after failed delivery"
                    );
                    dead.push(*entry.key());
                }
            }
        }
        // Removal happens outside the iteration guard.
        for id in dead {
            self.subscribers.remove(&id);
        }

        debug!(event_type, delivered, "event broadcast");
        delivered
    }
}
