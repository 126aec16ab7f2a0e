//! Topic registry for round broadcasts.
//!
//! Each connection owns one bounded outbound queue. Subscribing registers a
//! clone of that queue's sender under a topic; publishing pushes the same
//! `Arc`'d message into every subscriber queue in a single pass. Because the
//! scheduler is the only publisher of a round topic and every queue is FIFO,
//! all subscribers observe round events in the same order.
//!
//! Publishing never waits. A subscriber whose queue is full is evicted and
//! told to close: dropping one event for it would break the ordering
//! guarantee, and stalling would hold up the scheduler for everyone else.

use crate::error::EngineError;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{RejectReason, ServerMessage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

pub type ConnectionId = u64;

pub type Outbound = Arc<ServerMessage>;

/// Delivery handle for one connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

impl Subscriber {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Outbound>, evicted: Arc<Notify>) -> Self {
        Self {
            connection_id,
            tx,
            evicted,
        }
    }

    /// Queues a message for this connection without waiting.
    pub fn try_deliver(&self, message: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.tx.try_send(message)
    }

    /// Asks the owning connection to shut down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<String, BTreeMap<ConnectionId, Subscriber>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_topic(&self, topic: &str) {
        self.topics.lock().entry(topic.to_string()).or_default();
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Adds `subscriber` to `topic`. Returns `false` if it was already subscribed.
    pub fn subscribe(&self, topic: &str, subscriber: Subscriber) -> Result<bool, EngineError> {
        let mut topics = self.topics.lock();
        let subscribers = topics
            .get_mut(topic)
            .ok_or(EngineError::Validation(RejectReason::UnknownTopic))?;

        let connection_id = subscriber.connection_id;
        let added = subscribers.insert(connection_id, subscriber).is_none();
        if added {
            debug!("Connection {} subscribed to {}", connection_id, topic);
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, topic: &str, connection_id: ConnectionId) -> bool {
        let mut topics = self.topics.lock();
        topics
            .get_mut(topic)
            .map(|subscribers| subscribers.remove(&connection_id).is_some())
            .unwrap_or(false)
    }

    pub fn unsubscribe_all(&self, connection_id: ConnectionId) {
        let mut topics = self.topics.lock();
        for subscribers in topics.values_mut() {
            subscribers.remove(&connection_id);
        }
    }

    /// Delivers `message` to every subscriber of `topic`. Returns the number of
    /// subscribers that received it.
    pub fn publish(&self, topic: &str, message: ServerMessage) -> usize {
        let message = Arc::new(message);
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|connection_id, subscriber| {
            match subscriber.try_deliver(Arc::clone(&message)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Evicting lagging subscriber {} from {}",
                        connection_id, topic
                    );
                    subscriber.evict();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}
