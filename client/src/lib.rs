//! # Round Client Library
//!
//! This library provides the client side of the color-betting round
//! protocol. It connects to the round server over WebSocket, follows the
//! round topic and renders a smooth countdown from the server's periodic
//! remaining-time ticks.
//!
//! ## Architecture Overview
//!
//! The server is the only authority on round timing. The client never
//! decides when a phase ends; it only displays what the server announced,
//! interpolated between messages so the countdown does not jump once a
//! second.
//!
//! ### Countdown Interpolation
//! Every `timer_tick` and `phase_changed` anchors the countdown to the
//! server's remaining time. Between anchors the client subtracts local
//! monotonic elapsed time. Each new anchor discards any drift the local
//! clock accumulated.
//!
//! ### Version Ordering
//! Round events carry a strictly increasing version. The client ignores any
//! event older than the one it already applied, so a late tick can never
//! move the display back to an earlier phase.
//!
//! ## Module Organization
//!
//! ### Clock Module (`clock`)
//! - Anchor bookkeeping and countdown interpolation
//! - Phase progress for display
//! - Latest round result
//!
//! ### Network Module (`network`)
//! - Handshake with `Origin` and bearer token headers
//! - JSON and binary framing of protocol messages
//! - The interactive follower: auto-betting and admin overrides
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::RoundConnection;
//! use shared::{ClientMessage, Codec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection =
//!         RoundConnection::connect("ws://127.0.0.1:8080", None, None, Codec::Json).await?;
//!
//!     connection
//!         .send(&ClientMessage::Subscribe {
//!             round_topic: "color-round".to_string(),
//!             last_seen_version: None,
//!             request_ref: None,
//!         })
//!         .await?;
//!
//!     while let Some(message) = connection.recv().await? {
//!         println!("{:?}", message);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod network;
