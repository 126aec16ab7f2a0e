use crate::clock::RoundClock;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use shared::{ClientMessage, Codec, CodecError, Payload, Phase, ServerMessage};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
}

impl ClientError {
    /// HTTP status of a refused handshake.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::WebSocket(WsError::Http(response)) => Some(response.status().as_u16()),
            _ => None,
        }
    }
}

/// One WebSocket session with the round server.
pub struct RoundConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    codec: Codec,
}

impl RoundConnection {
    /// Opens a session. `origin` is sent as the `Origin` header and `token`
    /// as `Authorization: Bearer`.
    pub async fn connect(
        url: &str,
        origin: Option<&str>,
        token: Option<&str>,
        codec: Codec,
    ) -> Result<Self, ClientError> {
        let mut request = url.into_client_request()?;

        if let Some(origin) = origin {
            let value = HeaderValue::from_str(origin).map_err(|_| ClientError::InvalidHeader("origin"))?;
            request.headers_mut().insert("Origin", value);
        }
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ClientError::InvalidHeader("authorization"))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = connect_async(request).await?;
        let (sink, stream) = ws.split();

        Ok(Self { sink, stream, codec })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Switches the encoding of subsequent frames. The server answers in the
    /// codec of the last frame it received.
    pub fn set_codec(&mut self, codec: Codec) {
        self.codec = codec;
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let frame = match self.codec.encode(message)? {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.send_frame(frame).await
    }

    /// Sends a frame as-is, bypassing the codec.
    pub async fn send_frame(&mut self, frame: Message) -> Result<(), ClientError> {
        self.sink.send(frame).await?;
        Ok(())
    }

    /// Next server message. Returns `None` once the server closed the session.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(Codec::Json.decode(text.as_str().as_bytes())?)),
                Message::Binary(data) => return Ok(Some(Codec::Binary.decode(&data[..])?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: String,
    pub origin: Option<String>,
    pub token: Option<String>,
    pub topic: String,
    /// Stake placed once per round on a random outcome
    pub auto_bet: Option<u64>,
    pub outcomes: Vec<String>,
    /// Outcome submitted as an admin override once the window opens
    pub select: Option<String>,
    pub override_window_ms: u64,
    pub binary: bool,
}

/// Interactive round follower used by the `client` binary
pub struct RoundClient {
    connection: RoundConnection,
    options: ClientOptions,
    clock: RoundClock,
    started: Instant,
    bet_round: Option<u64>,
    selection_round: Option<u64>,
    next_nonce: u64,
    last_ping: Option<(u64, Instant)>,
    rtt_ms: Option<u64>,
}

impl RoundClient {
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let codec = if options.binary { Codec::Binary } else { Codec::Json };
        let connection = RoundConnection::connect(
            &options.server,
            options.origin.as_deref(),
            options.token.as_deref(),
            codec,
        )
        .await?;

        info!("Connected to {}", options.server);

        Ok(Self {
            connection,
            options,
            clock: RoundClock::new(),
            started: Instant::now(),
            bet_round: None,
            selection_round: None,
            next_nonce: 1,
            last_ping: None,
            rtt_ms: None,
        })
    }

    fn local_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub async fn run(&mut self) -> Result<(), ClientError> {
        self.connection
            .send(&ClientMessage::Subscribe {
                round_topic: self.options.topic.clone(),
                last_seen_version: None,
                request_ref: Some("subscribe".to_string()),
            })
            .await?;

        let mut display_interval = interval(Duration::from_millis(250));
        display_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ping_interval = interval(Duration::from_secs(5));
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        display_interval.tick().await;
        ping_interval.tick().await;

        loop {
            tokio::select! {
                message = self.connection.recv() => match message? {
                    Some(message) => {
                        if !self.handle_message(message).await? {
                            break;
                        }
                    }
                    None => {
                        warn!("Server closed the connection");
                        break;
                    }
                },

                _ = display_interval.tick() => self.log_countdown(),

                _ = ping_interval.tick() => {
                    let nonce = self.next_nonce;
                    self.next_nonce += 1;
                    self.last_ping = Some((nonce, Instant::now()));
                    self.connection.send(&ClientMessage::Ping { nonce }).await?;
                }
            }
        }

        Ok(())
    }

    /// Returns false once the session is over.
    async fn handle_message(&mut self, message: ServerMessage) -> Result<bool, ClientError> {
        let now = self.local_ms();
        let updated = self.clock.apply(&message, now);

        match message {
            ServerMessage::Subscribed {
                round_topic,
                round_id,
                version,
                ..
            } => {
                info!("Subscribed to {} at round {} (v{})", round_topic, round_id, version);
            }
            ServerMessage::PhaseChanged {
                round_id,
                new_phase,
                remaining_ms,
                version,
                ..
            } if updated => {
                info!(
                    "Round {} is now {} ({}ms left, v{})",
                    round_id, new_phase, remaining_ms, version
                );
                if new_phase == Phase::BettingOpen {
                    self.maybe_bet(round_id).await?;
                }
            }
            ServerMessage::TimerTick {
                round_id,
                phase,
                remaining_ms,
                version,
                ..
            } if updated => {
                if phase == Phase::BettingOpen {
                    self.maybe_bet(round_id).await?;
                    if remaining_ms <= self.options.override_window_ms {
                        self.maybe_select(round_id, version).await?;
                    }
                }
            }
            ServerMessage::RoundResolved {
                round_id,
                winning_outcome,
                resolution_source,
            } => {
                info!(
                    "Round {} resolved: {} ({})",
                    round_id, winning_outcome, resolution_source
                );
            }
            ServerMessage::BetAccepted {
                bet_id,
                round_id,
                outcome,
                amount,
                ..
            } => {
                info!("Bet {} accepted: {} on {} in round {}", bet_id, amount, outcome, round_id);
            }
            ServerMessage::SelectionAccepted {
                round_id,
                outcome,
                version,
                ..
            } => match outcome {
                Some(outcome) => info!("Override {} accepted for round {} (v{})", outcome, round_id, version),
                None => info!("Override withdrawn for round {}", round_id),
            },
            ServerMessage::Rejected {
                request_ref,
                reason_code,
                message,
                ..
            } => {
                warn!("Rejected {:?}: {} ({})", request_ref, reason_code, message);
            }
            ServerMessage::Pong {
                nonce,
                server_time_ms,
            } => {
                if let Some((sent_nonce, sent_at)) = self.last_ping {
                    if sent_nonce == nonce {
                        let rtt = sent_at.elapsed().as_millis() as u64;
                        self.rtt_ms = Some(rtt);
                        debug!("RTT {}ms, server time {}", rtt, server_time_ms);
                    }
                }
            }
            ServerMessage::Closing { reason_code } => {
                warn!("Server is closing the session: {}", reason_code);
                return Ok(false);
            }
            _ => {}
        }

        Ok(true)
    }

    async fn maybe_bet(&mut self, round_id: u64) -> Result<(), ClientError> {
        let Some(amount) = self.options.auto_bet else {
            return Ok(());
        };
        if self.bet_round == Some(round_id) {
            return Ok(());
        }
        let Some(outcome) = self.options.outcomes.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(());
        };

        self.bet_round = Some(round_id);
        info!("Betting {} on {} in round {}", amount, outcome, round_id);
        self.connection
            .send(&ClientMessage::PlaceBet {
                round_id,
                outcome,
                amount,
                request_ref: Some(format!("bet-{}", round_id)),
            })
            .await
    }

    async fn maybe_select(&mut self, round_id: u64, version: u64) -> Result<(), ClientError> {
        let Some(outcome) = self.options.select.clone() else {
            return Ok(());
        };
        if self.selection_round == Some(round_id) {
            return Ok(());
        }

        self.selection_round = Some(round_id);
        info!("Selecting {} for round {} at v{}", outcome, round_id, version);
        self.connection
            .send(&ClientMessage::SelectOutcome {
                round_id,
                outcome,
                round_version: version,
                request_ref: Some(format!("select-{}", round_id)),
            })
            .await
    }

    fn log_countdown(&self) {
        let now = self.local_ms();
        if let (Some(round_id), Some(phase)) = (self.clock.round_id(), self.clock.phase()) {
            info!(
                "Round {} {}: {:.1}s left ({:.0}%){}",
                round_id,
                phase,
                self.clock.remaining_ms(now) as f64 / 1_000.0,
                self.clock.progress(now) * 100.0,
                self.rtt_ms.map(|rtt| format!(", rtt {}ms", rtt)).unwrap_or_default()
            );
        }
    }
}
