//! Per-connection state and connection bookkeeping
//!
//! This module holds everything the gateway tracks about live connections:
//! - The [`ConnectionSession`] owned by each connection task
//! - Token-bucket rate limiting per identity class
//! - Penalty strikes that decay over time and escalate to closure
//! - Capacity enforcement and connection id assignment
//!
//! A session is created when the handshake is accepted and is mutated only
//! by the task that serves its connection.

use crate::auth::Identity;
use crate::config::{GatewayConfig, RateLimitConfig};
use crate::fanout::ConnectionId;
use log::info;
use shared::Codec;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Refillable quota of inbound messages
///
/// Tokens refill continuously at `refill_per_sec` up to `capacity`. Each
/// accepted message spends one token; the count never goes below zero.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: u64,
}

impl TokenBucket {
    /// Creates a full bucket
    pub fn new(config: RateLimitConfig, now_ms: u64) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: config.refill_per_sec / 1_000.0,
            last_refill: now_ms,
        }
    }

    /// Spends one token if available
    ///
    /// Returns false when the bucket is empty, in which case the message
    /// must be rejected as rate limited.
    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available
    pub fn available(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill);
        if elapsed > 0 {
            self.tokens = (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.capacity);
            self.last_refill = now_ms;
        }
    }
}

/// Size, liveness and penalty limits applied to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_message_bytes: usize,
    pub hard_message_bytes: usize,
    pub max_strikes: u32,
    pub strike_decay_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl From<&GatewayConfig> for SessionLimits {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            hard_message_bytes: config.hard_message_bytes,
            max_strikes: config.max_strikes,
            strike_decay_ms: config.strike_decay_ms,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
        }
    }
}

/// State of one live duplex connection
///
/// Each session maintains:
/// - Identity resolved at handshake time, fixed for the connection's life
/// - The topic it subscribed to, if any
/// - Activity tracking for heartbeat timeouts
/// - Rate bucket and penalty strikes
/// - The codec of the last inbound frame, used for replies
#[derive(Debug)]
pub struct ConnectionSession {
    /// Unique connection identifier assigned by the gateway
    pub connection_id: ConnectionId,
    pub identity: Identity,
    /// Origin header accepted at handshake, absent for native clients
    pub negotiated_origin: Option<String>,
    pub subscribed_round_topic: Option<String>,
    /// Last time any frame arrived from the peer
    pub last_activity_at: u64,
    pub codec: Codec,
    pub limits: SessionLimits,
    rate_bucket: TokenBucket,
    strikes: u32,
    last_decay_at: u64,
}

impl ConnectionSession {
    /// Creates a session whose rate class follows its identity
    pub fn new(
        connection_id: ConnectionId,
        identity: Identity,
        negotiated_origin: Option<String>,
        config: &GatewayConfig,
        now_ms: u64,
    ) -> Self {
        let rate_bucket = TokenBucket::new(identity.rate_limit(config), now_ms);
        Self {
            connection_id,
            identity,
            negotiated_origin,
            subscribed_round_topic: None,
            last_activity_at: now_ms,
            codec: Codec::Json,
            limits: SessionLimits::from(config),
            rate_bucket,
            strikes: 0,
            last_decay_at: now_ms,
        }
    }

    /// Marks the peer as alive
    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_at = self.last_activity_at.max(now_ms);
    }

    /// Checks if the peer has been silent past the heartbeat timeout
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_at) > self.limits.heartbeat_timeout_ms
    }

    pub fn try_consume_token(&mut self, now_ms: u64) -> bool {
        self.rate_bucket.try_acquire(now_ms)
    }

    /// Records one violation
    ///
    /// Returns true once the session has collected `max_strikes` strikes
    /// and must be closed.
    pub fn add_strike(&mut self, now_ms: u64) -> bool {
        self.decay_strikes(now_ms);
        self.strikes += 1;
        self.strikes >= self.limits.max_strikes
    }

    pub fn strikes(&mut self, now_ms: u64) -> u32 {
        self.decay_strikes(now_ms);
        self.strikes
    }

    fn decay_strikes(&mut self, now_ms: u64) {
        if self.limits.strike_decay_ms == 0 {
            return;
        }
        if self.strikes == 0 {
            self.last_decay_at = now_ms;
            return;
        }

        let periods = now_ms.saturating_sub(self.last_decay_at) / self.limits.strike_decay_ms;
        if periods > 0 {
            self.strikes = self.strikes.saturating_sub(periods.min(u64::from(u32::MAX)) as u32);
            self.last_decay_at += periods * self.limits.strike_decay_ms;
        }
    }
}

/// Bookkeeping entry for one accepted TCP connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub addr: SocketAddr,
    /// Unknown until the handshake completes
    pub identity: Option<Identity>,
}

/// Tracks every live connection and enforces the capacity limit
///
/// Slots are claimed when a TCP connection is accepted, before the
/// WebSocket handshake, so a burst of handshakes can never push the server
/// past `max_connections`.
#[derive(Debug)]
pub struct ConnectionManager {
    /// Live connections indexed by their unique ID
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// Next available ID for new connections
    next_connection_id: ConnectionId,
    /// Maximum number of concurrent connections allowed
    max_connections: usize,
}

impl ConnectionManager {
    /// Creates an empty manager with the given capacity
    ///
    /// Connection IDs start from 1 and increment for each new connection.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Attempts to claim a slot for a new connection
    ///
    /// Returns Some(connection_id) if successful, None if the server is at
    /// capacity.
    pub fn try_register(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(
            connection_id,
            ConnectionInfo {
                addr,
                identity: None,
            },
        );

        Some(connection_id)
    }

    /// Records the identity resolved at handshake time
    pub fn set_identity(&mut self, connection_id: ConnectionId, identity: Identity) {
        if let Some(info) = self.connections.get_mut(&connection_id) {
            info!(
                "Connection {} from {} authenticated as {}",
                connection_id, info.addr, identity
            );
            info.identity = Some(identity);
        }
    }

    /// Releases a slot. Returns false if it was already gone.
    pub fn remove(&mut self, connection_id: ConnectionId) -> bool {
        self.connections.remove(&connection_id).is_some()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of authenticated admin connections
    pub fn admin_count(&self) -> usize {
        self.connections
            .values()
            .filter(|info| matches!(info.identity, Some(Identity::Admin(_))))
            .count()
    }
}
