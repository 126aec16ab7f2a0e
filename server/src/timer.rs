//! Remaining-time broadcasts.
//!
//! The broadcaster is stateless apart from its topic and clock: every message
//! is computed from an immutable [`RoundSnapshot`], so building one never
//! needs the scheduler's lock.

use crate::clock::Clock;
use crate::fanout::{Subscriber, TopicRegistry};
use crate::round::RoundSnapshot;
use log::debug;
use shared::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

pub struct TimerBroadcaster {
    topic: String,
    registry: Arc<TopicRegistry>,
    clock: Arc<dyn Clock>,
}

impl TimerBroadcaster {
    pub fn new(topic: String, registry: Arc<TopicRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            topic,
            registry,
            clock,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `timer_tick` for `snapshot` at `now`. Remaining time never goes negative.
    pub fn tick_message(snapshot: &RoundSnapshot, now: u64) -> ServerMessage {
        ServerMessage::TimerTick {
            round_id: snapshot.round_id,
            phase: snapshot.phase,
            remaining_ms: snapshot.remaining_ms(now),
            version: snapshot.version,
            server_time_ms: now,
        }
    }

    /// `phase_changed` announcing the phase and deadline held by `snapshot`.
    pub fn transition_message(snapshot: &RoundSnapshot, now: u64) -> ServerMessage {
        ServerMessage::PhaseChanged {
            round_id: snapshot.round_id,
            new_phase: snapshot.phase,
            deadline: snapshot.deadline(),
            remaining_ms: snapshot.remaining_ms(now),
            version: snapshot.version,
            server_time_ms: now,
        }
    }

    /// Periodic tick to every subscriber.
    pub fn broadcast_tick(&self, snapshot: &RoundSnapshot) -> usize {
        let message = Self::tick_message(snapshot, self.clock.now_ms());
        let delivered = self.registry.publish(&self.topic, message);
        debug!(
            "Tick round {} {} v{} to {} subscribers",
            snapshot.round_id, snapshot.phase, snapshot.version, delivered
        );
        delivered
    }

    pub fn broadcast_transition(&self, snapshot: &RoundSnapshot) -> usize {
        let message = Self::transition_message(snapshot, self.clock.now_ms());
        self.registry.publish(&self.topic, message)
    }

    /// Immediate tick for one freshly subscribed connection.
    pub fn resync(
        &self,
        snapshot: &RoundSnapshot,
        subscriber: &Subscriber,
    ) -> Result<(), TrySendError<Arc<ServerMessage>>> {
        let message = Self::tick_message(snapshot, self.clock.now_ms());
        subscriber.try_deliver(Arc::new(message))
    }
}
