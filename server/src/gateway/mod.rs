//! WebSocket gateway between clients and the round engine
//!
//! The gateway owns the listening socket and one task per connection. Each
//! connection task:
//! - Resolves origin, capacity and identity during the HTTP upgrade, and
//!   gives up on peers that do not finish it within `handshake_timeout_ms`
//! - Refuses frames above `hard_message_bytes` before buffering them
//! - Runs inbound frames through the middleware pipeline before parsing
//! - Dispatches parsed requests to bet intake, the admin channel or the engine
//! - Drains its outbound queue, which carries both direct replies and topic
//!   broadcasts, in the codec of the last frame the peer sent
//! - Pings the peer and closes it after a heartbeat timeout
//!
//! Shutdown sends every session a `closing` frame before the engine stops.

pub mod pipeline;
pub mod session;

use crate::admin::{AdminOverrideChannel, OverrideRequest, SelectionAck};
use crate::auth::{token_from_request, Authenticator, Identity};
use crate::clock::Clock;
use crate::config::{EngineConfig, GatewayConfig};
use crate::engine::{EngineHandle, RoundEngine};
use crate::error::{EngineError, ServerError};
use crate::fanout::{ConnectionId, Outbound, Subscriber, TopicRegistry};
use crate::intake::{BetIntake, BetRequest};
use crate::ledger::Ledger;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pipeline::{check_origin, run_pipeline, InboundFrame, Verdict, INBOUND_STAGES};
use session::{ConnectionManager, ConnectionSession};
use shared::{ClientMessage, Codec, Payload, RejectReason, ServerMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Everything a connection task needs, shared by all of them
struct GatewayState {
    config: GatewayConfig,
    history_capacity: usize,
    clock: Arc<dyn Clock>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<TopicRegistry>,
    engine: EngineHandle,
    intake: BetIntake,
    admin: AdminOverrideChannel,
    connections: Mutex<ConnectionManager>,
}

impl GatewayState {
    /// Handshake checks: origin first, then the bearer token
    fn authorize(&self, request: &Request) -> Result<(Identity, Option<String>), ErrorResponse> {
        let origin = header(request, "origin");
        if let Err(err) = check_origin(origin, &self.config.allowed_origins) {
            warn!("Refusing handshake from origin {:?}", origin);
            return Err(refuse(StatusCode::FORBIDDEN, err.reason()));
        }

        let token = token_from_request(request.uri().query(), header(request, "authorization"));
        let identity = self
            .authenticator
            .authenticate(token.as_deref())
            .map_err(|err| {
                warn!("Refusing handshake: {}", err);
                refuse(StatusCode::UNAUTHORIZED, err.reason())
            })?;

        Ok((identity, origin.map(str::to_string)))
    }
}

/// Round server: listener, engine task and connection tasks
pub struct Server {
    listener: TcpListener,
    state: Arc<GatewayState>,
    engine_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Validates the config, binds the listener and starts the round engine.
    pub async fn bind(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ledger: Arc<dyn Ledger>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.gateway.bind).await?;
        info!(
            "Round server listening on {} (topic {})",
            listener.local_addr()?,
            config.topic
        );

        let registry = Arc::new(TopicRegistry::new());
        let (engine, engine_task) = RoundEngine::start(
            &config,
            Arc::clone(&clock),
            Arc::clone(&ledger),
            Arc::clone(&registry),
        );

        let outcomes = config.outcome_set();
        let intake = BetIntake::new(
            config.bets,
            outcomes.clone(),
            engine.snapshot_receiver(),
            engine.bet_book(),
            ledger,
        );
        let admin = AdminOverrideChannel::new(outcomes, engine.clone());
        let (shutdown_tx, _) = watch::channel(false);

        let state = GatewayState {
            connections: Mutex::new(ConnectionManager::new(config.gateway.max_connections)),
            config: config.gateway,
            history_capacity: config.history_capacity,
            clock,
            authenticator,
            registry,
            engine,
            intake,
            admin,
        };

        Ok(Self {
            listener,
            state: Arc::new(state),
            engine_task,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> EngineHandle {
        self.state.engine.clone()
    }

    pub fn registry(&self) -> Arc<TopicRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Serves until the process is killed.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes, then closes every session with
    /// `server_shutdown` and stops the engine.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        // The slot is claimed before the handshake so bursts cannot overshoot
        // the connection limit.
        let connection_id = self.state.connections.lock().try_register(addr);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(handle_connection(state, stream, addr, connection_id, shutdown));
    }

    async fn shutdown(self) {
        let open = self.state.connections.lock().len();
        info!("Shutting down round server, closing {} connections", open);

        self.shutdown_tx.send_replace(true);
        self.state.engine.shutdown().await;
        if let Err(e) = self.engine_task.await {
            error!("Round engine task failed: {}", e);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            let open = self.state.connections.lock().len();
            if open == 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn handle_connection(
    state: Arc<GatewayState>,
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: Option<ConnectionId>,
    shutdown: watch::Receiver<bool>,
) {
    let mut accepted = None;
    let handshake = timeout(
        state.config.handshake_timeout(),
        accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if connection_id.is_none() {
                    warn!("Refusing {}: server full", addr);
                    return Err(refuse(StatusCode::SERVICE_UNAVAILABLE, RejectReason::ServerFull));
                }
                accepted = Some(state.authorize(request)?);
                Ok(response)
            },
            Some(websocket_config(&state.config)),
        ),
    )
    .await;

    let Some(connection_id) = connection_id else {
        return;
    };

    let (ws, (identity, origin)) = match (handshake, accepted) {
        (Ok(Ok(ws)), Some(accepted)) => (ws, accepted),
        (Ok(Err(e)), _) => {
            debug!("Handshake with {} failed: {}", addr, e);
            state.connections.lock().remove(connection_id);
            return;
        }
        (Err(_), _) => {
            warn!("Handshake with {} timed out, releasing connection {}", addr, connection_id);
            state.connections.lock().remove(connection_id);
            return;
        }
        (Ok(Ok(_)), None) => {
            state.connections.lock().remove(connection_id);
            return;
        }
    };

    state.connections.lock().set_identity(connection_id, identity.clone());

    let now = state.clock.now_ms();
    let session = ConnectionSession::new(connection_id, identity, origin, &state.config, now);
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue);

    let connection = Connection {
        state,
        session,
        outbound_tx,
        evicted: Arc::new(Notify::new()),
    };
    connection.serve(ws, outbound_rx, shutdown).await;
}

enum Flow {
    Continue,
    /// Close the session, announcing the reason if there is one.
    Close(Option<RejectReason>),
}

struct Connection {
    state: Arc<GatewayState>,
    session: ConnectionSession,
    outbound_tx: mpsc::Sender<Outbound>,
    /// Signalled by the registry when this connection falls too far behind.
    evicted: Arc<Notify>,
}

impl Connection {
    async fn serve(
        mut self,
        ws: WebSocketStream<TcpStream>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let connection_id = self.session.connection_id;
        info!(
            "Connection {} established as {} (origin {:?})",
            connection_id, self.session.identity, self.session.negotiated_origin
        );

        let (mut sink, mut stream) = ws.split();
        let evicted = Arc::clone(&self.evicted);

        let mut heartbeat = interval(self.state.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        heartbeat.tick().await;

        let close_reason = loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break Some(RejectReason::ServerShutdown),

                _ = evicted.notified() => break Some(RejectReason::SubscriberLagging),

                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = write_message(&mut sink, self.session.codec, &message).await {
                            debug!("Write to connection {} failed: {}", connection_id, e);
                            break None;
                        }
                    }
                    None => break None,
                },

                inbound = stream.next() => match inbound {
                    Some(Ok(message)) => match self.on_message(message).await {
                        Flow::Continue => {}
                        Flow::Close(reason) => break reason,
                    },
                    Some(Err(WsError::Capacity(e))) => {
                        warn!("Connection {} sent an oversized frame: {}", connection_id, e);
                        break Some(RejectReason::MessageTooLarge);
                    }
                    Some(Err(e)) => {
                        debug!("Connection {} read error: {}", connection_id, e);
                        break None;
                    }
                    None => break None,
                },

                _ = heartbeat.tick() => {
                    if self.session.is_timed_out(self.state.clock.now_ms()) {
                        break Some(RejectReason::HeartbeatTimeout);
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break None;
                    }
                }
            }
        };

        if let Some(reason) = close_reason {
            info!("Closing connection {}: {}", connection_id, reason);
            let closing = ServerMessage::Closing {
                reason_code: reason,
            };
            let _ = write_message(&mut sink, self.session.codec, &closing).await;
            let _ = sink.send(Message::Close(None)).await;
        }
        let _ = sink.close().await;

        self.state.registry.unsubscribe_all(connection_id);
        self.state.connections.lock().remove(connection_id);
        info!("Connection {} disconnected", connection_id);
    }

    async fn on_message(&mut self, message: Message) -> Flow {
        let received_at = self.state.clock.now_ms();
        self.session.touch(received_at);

        let (payload, codec) = match &message {
            Message::Text(text) => (text.as_str().as_bytes(), Codec::Json),
            Message::Binary(data) => (&data[..], Codec::Binary),
            Message::Close(_) => return Flow::Close(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Flow::Continue,
        };
        self.session.codec = codec;

        let frame = InboundFrame {
            payload,
            received_at,
        };
        match run_pipeline(&INBOUND_STAGES, &frame, &mut self.session) {
            Verdict::Allow => {}
            Verdict::Reject(err) => return self.penalize(None, err, received_at),
            Verdict::Close(reason) => return Flow::Close(Some(reason)),
        }

        let request: ClientMessage = match codec.decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(
                    "Malformed frame from connection {}: {}",
                    self.session.connection_id, e
                );
                let err = EngineError::Protocol(RejectReason::MalformedMessage);
                return self.penalize(None, err, received_at);
            }
        };

        let request_ref = request.request_ref().map(str::to_string);
        match self.dispatch(request, received_at).await {
            Ok(Some(reply)) => self.queue(reply),
            Ok(None) => Flow::Continue,
            Err(err) if err.is_abuse() => self.penalize(request_ref, err, received_at),
            Err(err) => {
                if let EngineError::FatalInternal(_) = err {
                    error!("Connection {}: {}", self.session.connection_id, err);
                } else {
                    debug!("Rejected request from connection {}: {}", self.session.connection_id, err);
                }
                self.queue(rejected(request_ref, &err))
            }
        }
    }

    async fn dispatch(
        &mut self,
        request: ClientMessage,
        received_at: u64,
    ) -> Result<Option<ServerMessage>, EngineError> {
        let state = Arc::clone(&self.state);
        let connection_id = self.session.connection_id;

        match request {
            ClientMessage::Subscribe {
                round_topic,
                last_seen_version,
                request_ref,
            } => {
                let subscriber = Subscriber::new(
                    connection_id,
                    self.outbound_tx.clone(),
                    Arc::clone(&self.evicted),
                );
                // The engine queues the acknowledgement and resync frames itself.
                state
                    .engine
                    .subscribe(round_topic.clone(), subscriber, last_seen_version, request_ref)
                    .await?;
                self.session.subscribed_round_topic = Some(round_topic);
                Ok(None)
            }
            ClientMessage::Unsubscribe {
                round_topic,
                request_ref,
            } => {
                if !state.registry.has_topic(&round_topic) {
                    return Err(EngineError::Validation(RejectReason::UnknownTopic));
                }
                state.registry.unsubscribe(&round_topic, connection_id);
                if self.session.subscribed_round_topic.as_deref() == Some(round_topic.as_str()) {
                    self.session.subscribed_round_topic = None;
                }
                Ok(Some(ServerMessage::Unsubscribed {
                    round_topic,
                    request_ref,
                }))
            }
            ClientMessage::PlaceBet {
                round_id,
                outcome,
                amount,
                request_ref,
            } => {
                let request = BetRequest {
                    round_id,
                    outcome,
                    amount,
                    received_at,
                };
                let bet = state.intake.place_bet(&self.session.identity, request).await?;
                Ok(Some(ServerMessage::BetAccepted {
                    request_ref,
                    bet_id: bet.bet_id,
                    round_id: bet.round_id,
                    outcome: bet.chosen_outcome,
                    amount: bet.amount,
                }))
            }
            ClientMessage::SelectOutcome {
                round_id,
                outcome,
                round_version,
                request_ref,
            } => {
                let request = OverrideRequest {
                    round_id,
                    outcome,
                    round_version,
                    received_at,
                };
                let ack = state
                    .admin
                    .select_outcome(&self.session.identity, request)
                    .await?;
                Ok(Some(selection_accepted(request_ref, ack)))
            }
            ClientMessage::WithdrawSelection {
                round_id,
                round_version,
                request_ref,
            } => {
                let ack = state
                    .admin
                    .withdraw_selection(&self.session.identity, round_id, round_version, received_at)
                    .await?;
                Ok(Some(selection_accepted(request_ref, ack)))
            }
            ClientMessage::Ping { nonce } => Ok(Some(ServerMessage::Pong {
                nonce,
                server_time_ms: received_at,
            })),
            ClientMessage::History { limit, .. } => {
                let limit = (limit as usize).min(state.history_capacity);
                Ok(Some(ServerMessage::History {
                    rounds: state.engine.history(limit),
                }))
            }
        }
    }

    /// Counts a strike and answers with `rejected`, or closes the session
    /// once strikes run out.
    fn penalize(&mut self, request_ref: Option<String>, err: EngineError, now: u64) -> Flow {
        let exhausted = self.session.add_strike(now);
        warn!(
            "Strike for connection {} ({}): {}",
            self.session.connection_id, self.session.identity, err
        );
        if exhausted {
            return Flow::Close(Some(RejectReason::TooManyStrikes));
        }
        self.queue(rejected(request_ref, &err))
    }

    /// Direct replies share the outbound queue with broadcasts so that the
    /// peer sees them in the order they were produced.
    fn queue(&self, message: ServerMessage) -> Flow {
        match self.outbound_tx.try_send(Arc::new(message)) {
            Ok(()) => Flow::Continue,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {}",
                    self.session.connection_id
                );
                Flow::Close(Some(RejectReason::SubscriberLagging))
            }
            Err(TrySendError::Closed(_)) => Flow::Close(None),
        }
    }
}

async fn write_message(sink: &mut WsSink, codec: Codec, message: &ServerMessage) -> Result<(), WsError> {
    let frame = match codec.encode(message) {
        Ok(Payload::Text(text)) => Message::Text(text.into()),
        Ok(Payload::Binary(bytes)) => Message::Binary(bytes.into()),
        Err(e) => {
            error!("Failed to encode {:?}: {}", message, e);
            return Ok(());
        }
    };
    sink.send(frame).await
}

/// Frames above the hard limit are refused while reading the frame header,
/// before their payload is buffered.
fn websocket_config(config: &GatewayConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(config.hard_message_bytes))
        .max_frame_size(Some(config.hard_message_bytes))
}

fn rejected(request_ref: Option<String>, err: &EngineError) -> ServerMessage {
    ServerMessage::Rejected {
        request_ref,
        kind: err.kind(),
        reason_code: err.reason(),
        message: err.to_string(),
    }
}

fn selection_accepted(request_ref: Option<String>, ack: SelectionAck) -> ServerMessage {
    ServerMessage::SelectionAccepted {
        request_ref,
        round_id: ack.round_id,
        outcome: ack.outcome,
        version: ack.version,
    }
}

fn refuse(status: StatusCode, reason: RejectReason) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.as_str().to_string()));
    *response.status_mut() = status;
    response
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|value| value.to_str().ok())
}
