//! # Round Server Library
//!
//! This library provides the authoritative engine for a repeating, timed
//! color-betting round. It runs the round state machine, accepts bets and
//! admin overrides, decides each round's result and keeps every connected
//! client synchronized with a versioned stream of round events.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Round Timing
//! The server alone decides when a round opens, locks, resolves and
//! completes. Deadlines are derived from fixed phase durations and the
//! scheduled start of the round, so they never drift with timer jitter.
//! Clients receive remaining-time ticks and render a countdown from them.
//!
//! ### Bet and Override Intake
//! Bets are validated against the current phase and the bet limits, debited
//! through a ledger and recorded for the round. Admins may pre-select the
//! winning outcome during the last part of the betting phase; the latest
//! accepted selection before the lock wins.
//!
//! ### Result Resolution
//! When a round locks, its result is fixed exactly once: the admin selection
//! if one was frozen at the lock, otherwise the configured default policy.
//!
//! ### Event Fan-out
//! Every phase change, resolution and tick is published to the round topic.
//! Each subscriber has its own bounded queue; a subscriber that cannot keep
//! up is disconnected instead of slowing anyone else down.
//!
//! ## Architecture Design
//!
//! ### Single-Writer Engine Task
//! One task owns the scheduler and applies every state change in order:
//! timer deadlines, periodic ticks and admin commands. There is never more
//! than one writer, which keeps round versions strictly increasing and
//! makes "lock" and "override" impossible to interleave.
//!
//! ### Per-Connection Tasks
//! Each WebSocket connection has its own task which enforces the gateway
//! limits, talks to the engine through an [`engine::EngineHandle`] and
//! drains its outbound queue.
//!
//! ### Injected Collaborators
//! Time ([`clock::Clock`]), money ([`ledger::Ledger`]) and identity
//! ([`auth::Authenticator`]) are traits, so tests drive the engine with a
//! manual clock and an in-memory ledger.
//!
//! ## Module Organization
//!
//! ### Round Model (`round`, `scheduler`)
//! - Round records, schedules and immutable snapshots
//! - The phase state machine and the override window rules
//! - Completed-round history
//!
//! ### Intake (`intake`, `admin`)
//! - Bet validation, ledger debit and the per-round bet book
//! - The privileged override sub-protocol
//!
//! ### Resolution (`resolver`)
//! - Admin-first resolution with pluggable default policies
//!
//! ### Distribution (`engine`, `timer`, `fanout`)
//! - The engine task and its handle
//! - Tick and transition messages
//! - Topic registry with per-subscriber back-pressure
//!
//! ### Edge (`gateway`, `auth`)
//! - Handshake checks, rate limiting, size limits and heartbeats
//! - Identity resolution from bearer tokens
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{EngineConfig, InMemoryLedger, MonotonicClock, Server, StaticAuthenticator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let ledger = Arc::new(InMemoryLedger::new(config.ledger.starting_balance));
//!     let authenticator = Arc::new(StaticAuthenticator::new(config.admin_tokens.clone()));
//!
//!     let server = Server::bind(config, Arc::new(MonotonicClock::new()), ledger, authenticator).await?;
//!
//!     // Serve until Ctrl+C, then send every client a `closing` frame
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Security Considerations
//!
//! ### Handshake Checks
//! Browser origins must be on the allow-list and presented tokens must
//! resolve to an identity, otherwise the upgrade is refused.
//!
//! ### Rate Limiting and Penalties
//! Every inbound frame spends a token from a per-identity bucket before it
//! is parsed. Oversized, malformed and rate-limited frames collect strikes;
//! too many strikes close the session.
//!
//! ### Privileged Operations
//! Only sessions authenticated as admins can submit or withdraw result
//! selections, and every submission must name the current round version.

pub mod admin;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod intake;
pub mod ledger;
pub mod resolver;
pub mod round;
pub mod scheduler;
pub mod timer;

pub use auth::{Authenticator, Identity, StaticAuthenticator};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::EngineConfig;
pub use engine::{EngineHandle, RoundEngine};
pub use error::{EngineError, LedgerError, ServerError};
pub use gateway::Server;
pub use ledger::{InMemoryLedger, Ledger};
