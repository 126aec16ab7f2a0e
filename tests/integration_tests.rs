//! Integration tests for the round server and client
//!
//! These tests boot a real server on a loopback port with a shortened round
//! schedule and drive it through the client library's WebSocket connection.

use client::network::RoundConnection;
use server::config::{DefaultPolicyKind, ScheduleConfig};
use server::{EngineConfig, EngineHandle, InMemoryLedger, MonotonicClock, Server, ServerError, StaticAuthenticator};
use shared::{
    ClientMessage, Codec, ErrorKind, Outcome, Phase, RejectReason, ResolutionSource, ServerMessage, DEFAULT_TOPIC,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

const ALLOWED_ORIGIN: &str = "https://play.example.com";
const ADMIN_TOKEN: &str = "s3cret";

struct TestServer {
    url: String,
    engine: EngineHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn connect(&self, token: Option<&str>) -> RoundConnection {
        RoundConnection::connect(&self.url, None, token, Codec::Json)
            .await
            .expect("Failed to connect")
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Two-second betting phase with a one-second override window.
fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.gateway.bind = "127.0.0.1:0".to_string();
    config.gateway.allowed_origins = vec![ALLOWED_ORIGIN.to_string()];
    config.schedule = ScheduleConfig {
        betting_ms: 2_000,
        override_window_ms: 1_000,
        lock_ms: 200,
        result_ms: 600,
    };
    config.timer.broadcast_interval_ms = 100;
    config.bets.ledger_timeout_ms = 300;
    config
        .admin_tokens
        .insert(ADMIN_TOKEN.to_string(), "ops".to_string());
    config
}

async fn start_server(config: EngineConfig) -> TestServer {
    let ledger = Arc::new(InMemoryLedger::new(config.ledger.starting_balance));
    let authenticator = Arc::new(StaticAuthenticator::new(config.admin_tokens.clone()));
    let server = Server::bind(config, Arc::new(MonotonicClock::new()), ledger, authenticator)
        .await
        .expect("Failed to bind server");

    let url = format!("ws://{}", server.local_addr().unwrap());
    let engine = server.engine();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));

    TestServer {
        url,
        engine,
        shutdown: Some(shutdown_tx),
        task,
    }
}

async fn subscribe(connection: &mut RoundConnection, last_seen_version: Option<u64>) {
    connection
        .send(&ClientMessage::Subscribe {
            round_topic: DEFAULT_TOPIC.to_string(),
            last_seen_version,
            request_ref: Some("sub".to_string()),
        })
        .await
        .unwrap();
}

/// Reads until `pred` matches, failing on timeout or close.
async fn wait_for<F>(connection: &mut RoundConnection, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    timeout(Duration::from_secs(8), async {
        loop {
            match connection.recv().await.expect("Receive failed") {
                Some(message) if pred(&message) => return message,
                Some(_) => continue,
                None => panic!("Connection closed while waiting"),
            }
        }
    })
    .await
    .expect("Timed out waiting for message")
}

/// Next message that is not part of the round stream.
async fn next_reply(connection: &mut RoundConnection) -> ServerMessage {
    wait_for(connection, |message| {
        !matches!(
            message,
            ServerMessage::TimerTick { .. } | ServerMessage::PhaseChanged { .. } | ServerMessage::RoundResolved { .. }
        )
    })
    .await
}

/// Drains the session until it closes and returns the last non-stream
/// message, if any arrived before the socket went away.
async fn last_words(connection: &mut RoundConnection) -> Option<ServerMessage> {
    timeout(Duration::from_secs(5), async {
        let mut last = None;
        loop {
            match connection.recv().await {
                Ok(Some(
                    ServerMessage::TimerTick { .. }
                    | ServerMessage::PhaseChanged { .. }
                    | ServerMessage::RoundResolved { .. },
                )) => continue,
                Ok(Some(message)) => last = Some(message),
                Ok(None) | Err(_) => return last,
            }
        }
    })
    .await
    .expect("Session was never closed")
}

fn assert_rejected(message: &ServerMessage, expected_kind: ErrorKind, expected_reason: RejectReason) {
    match message {
        ServerMessage::Rejected {
            kind, reason_code, ..
        } => {
            assert_eq!(*kind, expected_kind);
            assert_eq!(*reason_code, expected_reason);
        }
        other => panic!("Expected rejection, got {:?}", other),
    }
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    async fn refused_status(url: &str, origin: Option<&str>, token: Option<&str>) -> Option<u16> {
        match RoundConnection::connect(url, origin, token, Codec::Json).await {
            Ok(_) => None,
            Err(err) => err.http_status(),
        }
    }

    #[tokio::test]
    async fn test_origin_allow_list() {
        let server = start_server(test_config()).await;

        assert_eq!(
            refused_status(&server.url, Some("https://evil.example.com"), None).await,
            Some(403)
        );

        let allowed = RoundConnection::connect(&server.url, Some(ALLOWED_ORIGIN), None, Codec::Json).await;
        assert!(allowed.is_ok());

        // Native clients send no Origin header at all.
        let native = RoundConnection::connect(&server.url, None, None, Codec::Json).await;
        assert!(native.is_ok());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_token_is_refused() {
        let server = start_server(test_config()).await;

        assert_eq!(
            refused_status(&server.url, None, Some("not a token!")).await,
            Some(401)
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_handshake_releases_its_slot() {
        let mut config = test_config();
        config.gateway.max_connections = 1;
        config.gateway.handshake_timeout_ms = 300;
        let server = start_server(config).await;

        // Opens TCP and never sends the upgrade request.
        let mut idle = TcpStream::connect(server.url.trim_start_matches("ws://")).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(refused_status(&server.url, None, None).await, Some(503));

        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("Idle socket was never dropped");
        assert!(matches!(read, Ok(0) | Err(_)));

        let mut connection = server.connect(None).await;
        connection.send(&ClientMessage::Ping { nonce: 3 }).await.unwrap();
        assert!(matches!(next_reply(&mut connection).await, ServerMessage::Pong { nonce: 3, .. }));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let mut config = test_config();
        config.gateway.max_connections = 1;
        let server = start_server(config).await;

        let mut first = server.connect(None).await;
        subscribe(&mut first, None).await;
        assert!(matches!(next_reply(&mut first).await, ServerMessage::Subscribed { .. }));

        assert_eq!(refused_status(&server.url, None, None).await, Some(503));

        first.close().await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(RoundConnection::connect(&server.url, None, None, Codec::Json).await.is_ok());

        server.stop().await;
    }
}

/// ROUND STREAM TESTS
mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_ack_then_resync_then_ticks() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;

        subscribe(&mut connection, None).await;

        let ack = connection.recv().await.unwrap().unwrap();
        let (round_id, version) = match ack {
            ServerMessage::Subscribed {
                round_topic,
                round_id,
                version,
                request_ref,
            } => {
                assert_eq!(round_topic, DEFAULT_TOPIC);
                assert_eq!(request_ref.as_deref(), Some("sub"));
                (round_id, version)
            }
            other => panic!("Expected subscribed, got {:?}", other),
        };
        assert_eq!(round_id, 1);

        match connection.recv().await.unwrap().unwrap() {
            ServerMessage::PhaseChanged {
                round_id: changed_round,
                new_phase,
                version: changed_version,
                ..
            } => {
                assert_eq!(changed_round, 1);
                assert_eq!(new_phase, Phase::BettingOpen);
                assert_eq!(changed_version, version);
            }
            other => panic!("Expected phase_changed, got {:?}", other),
        }

        let tick = wait_for(&mut connection, |m| matches!(m, ServerMessage::TimerTick { .. })).await;
        match tick {
            ServerMessage::TimerTick { remaining_ms, .. } => assert!(remaining_ms <= 2_000),
            _ => unreachable!(),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_up_to_date_resubscribe_skips_replay() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;
        let version = server.engine.snapshot().version;

        subscribe(&mut connection, Some(version)).await;

        assert!(matches!(
            connection.recv().await.unwrap().unwrap(),
            ServerMessage::Subscribed { .. }
        ));
        assert!(matches!(
            connection.recv().await.unwrap().unwrap(),
            ServerMessage::TimerTick { .. }
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;

        connection
            .send(&ClientMessage::Subscribe {
                round_topic: "dice".to_string(),
                last_seen_version: None,
                request_ref: None,
            })
            .await
            .unwrap();

        assert_rejected(
            &next_reply(&mut connection).await,
            ErrorKind::Validation,
            RejectReason::UnknownTopic,
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_phases_arrive_in_order_with_increasing_versions() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;
        subscribe(&mut connection, None).await;

        let mut seen = Vec::new();
        let mut last_version = 0;
        while seen.len() < 5 {
            if let ServerMessage::PhaseChanged {
                round_id,
                new_phase,
                version,
                ..
            } = wait_for(&mut connection, |m| matches!(m, ServerMessage::PhaseChanged { .. })).await
            {
                assert!(version > last_version);
                last_version = version;
                seen.push((round_id, new_phase));
            }
        }

        assert_eq!(
            seen,
            vec![
                (1, Phase::BettingOpen),
                (1, Phase::Locked),
                (1, Phase::Resolving),
                (1, Phase::Completed),
                (2, Phase::BettingOpen),
            ]
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_binary_session() {
        let server = start_server(test_config()).await;
        let mut connection = RoundConnection::connect(&server.url, None, None, Codec::Binary)
            .await
            .unwrap();

        subscribe(&mut connection, None).await;
        assert!(matches!(
            connection.recv().await.unwrap().unwrap(),
            ServerMessage::Subscribed { round_id: 1, .. }
        ));

        connection.send(&ClientMessage::Ping { nonce: 9 }).await.unwrap();
        assert!(matches!(
            next_reply(&mut connection).await,
            ServerMessage::Pong { nonce: 9, .. }
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_closing() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;
        subscribe(&mut connection, None).await;
        wait_for(&mut connection, |m| matches!(m, ServerMessage::Subscribed { .. })).await;

        let TestServer { shutdown, task, .. } = server;
        if let Some(shutdown) = shutdown {
            shutdown.send(()).unwrap();
        }

        let closing = wait_for(&mut connection, |m| matches!(m, ServerMessage::Closing { .. })).await;
        assert_eq!(
            closing,
            ServerMessage::Closing {
                reason_code: RejectReason::ServerShutdown
            }
        );

        let result = timeout(Duration::from_secs(5), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

/// BET INTAKE TESTS
mod bet_tests {
    use super::*;

    fn place_bet(round_id: u64, outcome: &str, amount: u64, request_ref: &str) -> ClientMessage {
        ClientMessage::PlaceBet {
            round_id,
            outcome: outcome.to_string(),
            amount,
            request_ref: Some(request_ref.to_string()),
        }
    }

    #[tokio::test]
    async fn test_bet_accepted_while_open_and_refused_after_lock() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(Some("alice")).await;
        subscribe(&mut connection, None).await;

        connection.send(&place_bet(1, "Green", 250, "b1")).await.unwrap();
        match wait_for(&mut connection, |m| matches!(m, ServerMessage::BetAccepted { .. } | ServerMessage::Rejected { .. })).await {
            ServerMessage::BetAccepted {
                request_ref,
                round_id,
                outcome,
                amount,
                ..
            } => {
                assert_eq!(request_ref.as_deref(), Some("b1"));
                assert_eq!(round_id, 1);
                assert_eq!(outcome, Outcome::new("green"));
                assert_eq!(amount, 250);
            }
            other => panic!("Expected bet_accepted, got {:?}", other),
        }

        wait_for(&mut connection, |m| {
            matches!(
                m,
                ServerMessage::PhaseChanged {
                    round_id: 1,
                    new_phase: Phase::Locked,
                    ..
                }
            )
        })
        .await;

        connection.send(&place_bet(1, "green", 250, "b2")).await.unwrap();
        let rejected = wait_for(&mut connection, |m| matches!(m, ServerMessage::Rejected { .. })).await;
        assert_rejected(&rejected, ErrorKind::WindowClosed, RejectReason::BettingClosed);

        connection.send(&place_bet(2, "green", 250, "b3")).await.unwrap();
        let rejected = wait_for(&mut connection, |m| matches!(m, ServerMessage::Rejected { .. })).await;
        assert_rejected(&rejected, ErrorKind::Validation, RejectReason::UnknownRound);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bet_validation() {
        let server = start_server(test_config()).await;
        let mut player = server.connect(Some("bob")).await;

        player.send(&place_bet(1, "orange", 10, "b1")).await.unwrap();
        assert_rejected(&next_reply(&mut player).await, ErrorKind::Validation, RejectReason::InvalidOutcome);

        player.send(&place_bet(1, "red", 0, "b2")).await.unwrap();
        assert_rejected(&next_reply(&mut player).await, ErrorKind::Validation, RejectReason::InvalidAmount);

        player.send(&place_bet(1, "red", 1_000_000, "b3")).await.unwrap();
        assert_rejected(&next_reply(&mut player).await, ErrorKind::Validation, RejectReason::InvalidAmount);

        let mut anonymous = server.connect(None).await;
        anonymous.send(&place_bet(1, "red", 10, "b4")).await.unwrap();
        assert_rejected(&next_reply(&mut anonymous).await, ErrorKind::Validation, RejectReason::Unauthorized);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let mut config = test_config();
        config.ledger.starting_balance = 100;
        let server = start_server(config).await;
        let mut player = server.connect(Some("carol")).await;

        player.send(&place_bet(1, "red", 80, "b1")).await.unwrap();
        assert!(matches!(next_reply(&mut player).await, ServerMessage::BetAccepted { .. }));

        player.send(&place_bet(1, "red", 80, "b2")).await.unwrap();
        assert_rejected(&next_reply(&mut player).await, ErrorKind::Validation, RejectReason::InsufficientFunds);

        server.stop().await;
    }
}

/// ADMIN OVERRIDE AND RESOLUTION TESTS
mod resolution_tests {
    use super::*;

    /// Waits until round 1's override window is open and returns its version.
    async fn wait_for_override_window(connection: &mut RoundConnection) -> u64 {
        match wait_for(connection, |m| {
            matches!(
                m,
                ServerMessage::TimerTick {
                    round_id: 1,
                    phase: Phase::BettingOpen,
                    remaining_ms,
                    ..
                } if *remaining_ms <= 900
            )
        })
        .await
        {
            ServerMessage::TimerTick { version, .. } => version,
            _ => unreachable!(),
        }
    }

    fn select(outcome: &str, version: u64, request_ref: &str) -> ClientMessage {
        ClientMessage::SelectOutcome {
            round_id: 1,
            outcome: outcome.to_string(),
            round_version: version,
            request_ref: Some(request_ref.to_string()),
        }
    }

    #[tokio::test]
    async fn test_latest_override_wins() {
        let server = start_server(test_config()).await;
        let mut admin = server.connect(Some(ADMIN_TOKEN)).await;
        subscribe(&mut admin, None).await;

        let version = wait_for_override_window(&mut admin).await;

        admin.send(&select("red", version, "s1")).await.unwrap();
        admin.send(&select("blue", version, "s2")).await.unwrap();

        for expected in ["red", "blue"] {
            match wait_for(&mut admin, |m| {
                matches!(m, ServerMessage::SelectionAccepted { .. } | ServerMessage::Rejected { .. })
            })
            .await
            {
                ServerMessage::SelectionAccepted { outcome, round_id, .. } => {
                    assert_eq!(round_id, 1);
                    assert_eq!(outcome, Some(Outcome::new(expected)));
                }
                other => panic!("Expected selection_accepted, got {:?}", other),
            }
        }

        let resolved = wait_for(&mut admin, |m| matches!(m, ServerMessage::RoundResolved { .. })).await;
        assert_eq!(
            resolved,
            ServerMessage::RoundResolved {
                round_id: 1,
                winning_outcome: Outcome::new("blue"),
                resolution_source: ResolutionSource::AdminOverride,
            }
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_withdrawn_override_falls_back_to_default_policy() {
        let mut config = test_config();
        config.resolver.default_policy = DefaultPolicyKind::LeastWagered;
        let server = start_server(config).await;
        let mut admin = server.connect(Some(ADMIN_TOKEN)).await;
        subscribe(&mut admin, None).await;

        let version = wait_for_override_window(&mut admin).await;
        admin.send(&select("violet", version, "s1")).await.unwrap();
        admin
            .send(&ClientMessage::WithdrawSelection {
                round_id: 1,
                round_version: version,
                request_ref: Some("w1".to_string()),
            })
            .await
            .unwrap();

        let withdrawn = wait_for(&mut admin, |m| {
            matches!(m, ServerMessage::SelectionAccepted { outcome: None, .. })
        })
        .await;
        assert!(matches!(withdrawn, ServerMessage::SelectionAccepted { round_id: 1, .. }));

        let resolved = wait_for(&mut admin, |m| matches!(m, ServerMessage::RoundResolved { .. })).await;
        assert_eq!(
            resolved,
            ServerMessage::RoundResolved {
                round_id: 1,
                winning_outcome: Outcome::new("red"),
                resolution_source: ResolutionSource::DefaultPolicy,
            }
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_least_wagered_default_policy() {
        let mut config = test_config();
        config.resolver.default_policy = DefaultPolicyKind::LeastWagered;
        let server = start_server(config).await;

        let mut player = server.connect(Some("dave")).await;
        player
            .send(&ClientMessage::PlaceBet {
                round_id: 1,
                outcome: "red".to_string(),
                amount: 100,
                request_ref: None,
            })
            .await
            .unwrap();
        assert!(matches!(next_reply(&mut player).await, ServerMessage::BetAccepted { .. }));
        subscribe(&mut player, None).await;

        let resolved = wait_for(&mut player, |m| matches!(m, ServerMessage::RoundResolved { .. })).await;
        assert_eq!(
            resolved,
            ServerMessage::RoundResolved {
                round_id: 1,
                winning_outcome: Outcome::new("green"),
                resolution_source: ResolutionSource::DefaultPolicy,
            }
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_override_rules() {
        let server = start_server(test_config()).await;

        let mut player = server.connect(Some("erin")).await;
        player.send(&select("red", 1, "p1")).await.unwrap();
        assert_rejected(&next_reply(&mut player).await, ErrorKind::Validation, RejectReason::Unauthorized);

        let mut admin = server.connect(Some(ADMIN_TOKEN)).await;
        admin.send(&select("red", 1, "a1")).await.unwrap();
        assert_rejected(
            &next_reply(&mut admin).await,
            ErrorKind::WindowClosed,
            RejectReason::OverrideWindowNotOpen,
        );

        subscribe(&mut admin, None).await;
        let version = wait_for_override_window(&mut admin).await;
        admin.send(&select("red", version - 1, "a2")).await.unwrap();
        assert_rejected(
            &wait_for(&mut admin, |m| matches!(m, ServerMessage::Rejected { .. })).await,
            ErrorKind::StaleVersion,
            RejectReason::StaleVersion,
        );

        wait_for(&mut admin, |m| {
            matches!(m, ServerMessage::PhaseChanged { new_phase: Phase::Locked, .. })
        })
        .await;
        admin.send(&select("red", version, "a3")).await.unwrap();
        assert_rejected(
            &wait_for(&mut admin, |m| matches!(m, ServerMessage::Rejected { .. })).await,
            ErrorKind::WindowClosed,
            RejectReason::OverrideWindowClosed,
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_history_lists_completed_rounds() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;
        subscribe(&mut connection, None).await;

        wait_for(&mut connection, |m| {
            matches!(
                m,
                ServerMessage::PhaseChanged {
                    round_id: 2,
                    new_phase: Phase::BettingOpen,
                    ..
                }
            )
        })
        .await;

        connection
            .send(&ClientMessage::History {
                limit: 10,
                request_ref: None,
            })
            .await
            .unwrap();

        match next_reply(&mut connection).await {
            ServerMessage::History { rounds } => {
                assert_eq!(rounds.len(), 1);
                assert_eq!(rounds[0].round_id, 1);
                assert_eq!(rounds[0].resolution_source, ResolutionSource::DefaultPolicy);
            }
            other => panic!("Expected history, got {:?}", other),
        }

        server.stop().await;
    }
}

/// GATEWAY LIMIT TESTS
mod limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_rate_limited_without_closing() {
        let mut config = test_config();
        config.gateway.admin_rate.capacity = 10;
        config.gateway.admin_rate.refill_per_sec = 1.0;
        let server = start_server(config).await;
        let mut admin = server.connect(Some(ADMIN_TOKEN)).await;

        for nonce in 0..15 {
            admin.send(&ClientMessage::Ping { nonce }).await.unwrap();
        }

        let mut pongs = 0;
        let mut limited = 0;
        for _ in 0..15 {
            match next_reply(&mut admin).await {
                ServerMessage::Pong { .. } => pongs += 1,
                message => {
                    assert_rejected(&message, ErrorKind::RateLimited, RejectReason::RateLimited);
                    limited += 1;
                }
            }
        }
        assert_eq!(pongs, 10);
        assert_eq!(limited, 5);

        sleep(Duration::from_millis(1_200)).await;
        admin.send(&ClientMessage::Ping { nonce: 99 }).await.unwrap();
        assert!(matches!(
            next_reply(&mut admin).await,
            ServerMessage::Pong { nonce: 99, .. }
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_and_oversized_frames() {
        let server = start_server(test_config()).await;
        let mut connection = server.connect(None).await;

        connection
            .send_frame(Message::Text("{\"place_bet\":".into()))
            .await
            .unwrap();
        assert_rejected(
            &next_reply(&mut connection).await,
            ErrorKind::Protocol,
            RejectReason::MalformedMessage,
        );

        let soft = "x".repeat(12 * 1024);
        connection.send_frame(Message::Text(soft.into())).await.unwrap();
        assert_rejected(
            &next_reply(&mut connection).await,
            ErrorKind::Protocol,
            RejectReason::MessageTooLarge,
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_frames_over_hard_limit_close_the_session() {
        let mut config = test_config();
        config.gateway.max_connections = 1;
        let server = start_server(config).await;
        let mut connection = server.connect(None).await;

        // 8 MiB against a 64 KiB hard limit: the server stops reading at the
        // frame header, so the write may fail half way.
        let huge = vec![0u8; 8 * 1024 * 1024];
        let sent = timeout(Duration::from_secs(5), connection.send_frame(Message::Binary(huge.into()))).await;
        assert!(sent.is_ok(), "Oversized write was never refused");

        if let Some(message) = last_words(&mut connection).await {
            assert_eq!(
                message,
                ServerMessage::Closing {
                    reason_code: RejectReason::MessageTooLarge
                }
            );
        }

        // The slot is free again.
        sleep(Duration::from_millis(200)).await;
        let mut next = server.connect(None).await;
        next.send(&ClientMessage::Ping { nonce: 1 }).await.unwrap();
        assert!(matches!(next_reply(&mut next).await, ServerMessage::Pong { nonce: 1, .. }));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_peer_hits_heartbeat_timeout() {
        let mut config = test_config();
        config.gateway.heartbeat_interval_ms = 100;
        config.gateway.heartbeat_timeout_ms = 300;
        let server = start_server(config).await;

        // Upgrades by hand and never writes again, so no ping is ever answered.
        let mut silent = TcpStream::connect(server.url.trim_start_matches("ws://")).await.unwrap();
        silent
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: 127.0.0.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        // A client library peer keeps reading and answers every ping.
        let mut live = server.connect(None).await;
        subscribe(&mut live, None).await;
        let _ = timeout(Duration::from_millis(800), async {
            while let Ok(Some(_)) = live.recv().await {}
        })
        .await;

        let mut received = Vec::new();
        timeout(Duration::from_secs(3), silent.read_to_end(&mut received))
            .await
            .expect("Silent peer was never disconnected")
            .unwrap();
        assert!(received.starts_with(b"HTTP/1.1 101"));
        assert!(contains(&received, b"\"closing\""));
        assert!(contains(&received, b"heartbeat_timeout"));

        live.send(&ClientMessage::Ping { nonce: 7 }).await.unwrap();
        assert!(matches!(next_reply(&mut live).await, ServerMessage::Pong { nonce: 7, .. }));

        server.stop().await;
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[tokio::test]
    async fn test_strikes_close_the_session() {
        let mut config = test_config();
        config.gateway.max_strikes = 3;
        let server = start_server(config).await;
        let mut connection = server.connect(None).await;

        for _ in 0..3 {
            connection
                .send_frame(Message::Text("garbage".into()))
                .await
                .unwrap();
        }

        for _ in 0..2 {
            assert_rejected(
                &next_reply(&mut connection).await,
                ErrorKind::Protocol,
                RejectReason::MalformedMessage,
            );
        }
        assert_eq!(
            next_reply(&mut connection).await,
            ServerMessage::Closing {
                reason_code: RejectReason::TooManyStrikes
            }
        );

        server.stop().await;
    }
}
