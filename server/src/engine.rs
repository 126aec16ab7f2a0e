//! The round engine task.
//!
//! One task owns the [`RoundScheduler`] and is the single publisher of the
//! round topic. Connection tasks talk to it through an [`EngineHandle`]:
//! mutations and subscriptions are commands processed one at a time, while
//! the current [`RoundSnapshot`] and the round history are readable without
//! a round trip.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fanout::{Subscriber, TopicRegistry};
use crate::intake::BetBook;
use crate::ledger::Ledger;
use crate::resolver::{policy_from_config, ResultResolver};
use crate::round::{AdminSelection, ArchivedRound, RoundHistory, RoundId, RoundSnapshot};
use crate::scheduler::{RoundEvent, RoundScheduler};
use crate::timer::TimerBroadcaster;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use shared::{Phase, RejectReason, RoundSummary, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const COMMAND_QUEUE: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug)]
pub enum EngineCommand {
    Subscribe {
        topic: String,
        subscriber: Subscriber,
        last_seen_version: Option<u64>,
        request_ref: Option<String>,
        reply: Reply<()>,
    },
    SelectOutcome {
        selection: AdminSelection,
        reply: Reply<u64>,
    },
    WithdrawSelection {
        admin: String,
        round_id: RoundId,
        round_version: u64,
        received_at: u64,
        reply: Reply<u64>,
    },
    Shutdown,
}

/// Cloneable access to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    snapshot: watch::Receiver<RoundSnapshot>,
    history: Arc<RwLock<RoundHistory>>,
    book: Arc<BetBook>,
}

impl EngineHandle {
    /// Latest published snapshot. Never blocks on the engine.
    pub fn snapshot(&self) -> RoundSnapshot {
        *self.snapshot.borrow()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<RoundSnapshot> {
        self.snapshot.clone()
    }

    pub fn bet_book(&self) -> Arc<BetBook> {
        Arc::clone(&self.book)
    }

    /// Most recent completed rounds, newest first.
    pub fn history(&self, limit: usize) -> Vec<RoundSummary> {
        self.history.read().recent(limit)
    }

    /// Registers `subscriber` on `topic` and queues its resync frames.
    pub async fn subscribe(
        &self,
        topic: String,
        subscriber: Subscriber,
        last_seen_version: Option<u64>,
        request_ref: Option<String>,
    ) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Subscribe {
            topic,
            subscriber,
            last_seen_version,
            request_ref,
            reply,
        })
        .await
    }

    /// Returns the round version the selection was accepted at.
    pub async fn select_outcome(&self, selection: AdminSelection) -> Result<u64, EngineError> {
        self.request(|reply| EngineCommand::SelectOutcome { selection, reply })
            .await
    }

    pub async fn withdraw_selection(
        &self,
        admin: String,
        round_id: RoundId,
        round_version: u64,
        received_at: u64,
    ) -> Result<u64, EngineError> {
        self.request(|reply| EngineCommand::WithdrawSelection {
            admin,
            round_id,
            round_version,
            received_at,
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| engine_stopped())?;
        response.await.map_err(|_| engine_stopped())?
    }
}

fn engine_stopped() -> EngineError {
    EngineError::FatalInternal("round engine is not running".to_string())
}

pub struct RoundEngine {
    scheduler: RoundScheduler,
    timer: TimerBroadcaster,
    registry: Arc<TopicRegistry>,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn Ledger>,
    history: Arc<RwLock<RoundHistory>>,
    snapshot_tx: watch::Sender<RoundSnapshot>,
    commands: mpsc::Receiver<EngineCommand>,
    broadcast_interval: Duration,
    archive_timeout: Duration,
}

impl RoundEngine {
    /// Builds the engine with round 1 opening now, and registers its topic.
    pub fn new(
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        ledger: Arc<dyn Ledger>,
        registry: Arc<TopicRegistry>,
    ) -> (Self, EngineHandle) {
        registry.register_topic(&config.topic);

        let book = Arc::new(BetBook::default());
        let resolver = ResultResolver::new(config.outcome_set(), policy_from_config(&config.resolver));
        let scheduler = RoundScheduler::new(
            config.schedule,
            resolver,
            Arc::clone(&book),
            clock.now_ms(),
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(scheduler.snapshot());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let history = Arc::new(RwLock::new(RoundHistory::new(config.history_capacity)));

        let timer = TimerBroadcaster::new(
            config.topic.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
        );

        let engine = Self {
            scheduler,
            timer,
            registry,
            clock,
            ledger,
            history: Arc::clone(&history),
            snapshot_tx,
            commands: command_rx,
            broadcast_interval: Duration::from_millis(config.timer.broadcast_interval_ms),
            archive_timeout: config.bets.ledger_timeout(),
        };

        let handle = EngineHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            history,
            book,
        };

        (engine, handle)
    }

    /// Spawns the engine task.
    pub fn start(
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        ledger: Arc<dyn Ledger>,
        registry: Arc<TopicRegistry>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(config, clock, ledger, registry);
        let task = tokio::spawn(engine.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        info!("Round engine serving topic {}", self.timer.topic());

        loop {
            let wait = self
                .scheduler
                .next_deadline()
                .saturating_sub(self.clock.now_ms());

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {
                    self.step();
                }
                _ = ticker.tick() => {
                    self.step();
                    self.timer.broadcast_tick(&self.scheduler.snapshot());
                }
                command = self.commands.recv() => {
                    self.step();
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.handle(command),
                    }
                }
            }
        }

        info!("Round engine stopped");
    }

    /// Applies every due transition and publishes what it produced.
    fn step(&mut self) {
        let events = self.scheduler.advance(self.clock.now_ms());

        for event in events {
            match event {
                RoundEvent::PhaseChanged(snapshot) => {
                    self.snapshot_tx.send_replace(snapshot);
                    let delivered = self.timer.broadcast_transition(&snapshot);
                    debug!(
                        "Announced round {} {} to {} subscribers",
                        snapshot.round_id, snapshot.phase, delivered
                    );
                }
                RoundEvent::Resolved {
                    round_id,
                    resolution,
                } => {
                    self.registry.publish(
                        self.timer.topic(),
                        ServerMessage::RoundResolved {
                            round_id,
                            winning_outcome: resolution.outcome,
                            resolution_source: resolution.source,
                        },
                    );
                }
                RoundEvent::Archived(archived) => {
                    self.history.write().push(Arc::clone(&archived));
                    self.spawn_archive(archived);
                }
            }
        }
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Subscribe {
                topic,
                subscriber,
                last_seen_version,
                request_ref,
                reply,
            } => {
                let result = self.subscribe(&topic, subscriber, last_seen_version, request_ref);
                let _ = reply.send(result);
            }
            EngineCommand::SelectOutcome { selection, reply } => {
                let result = self
                    .scheduler
                    .select_outcome(selection)
                    .map(|()| self.scheduler.snapshot().version);
                let _ = reply.send(result);
            }
            EngineCommand::WithdrawSelection {
                admin,
                round_id,
                round_version,
                received_at,
                reply,
            } => {
                let result = self
                    .scheduler
                    .withdraw_selection(&admin, round_id, round_version, received_at)
                    .map(|()| self.scheduler.snapshot().version);
                let _ = reply.send(result);
            }
            EngineCommand::Shutdown => {}
        }
    }

    /// Registration and resync happen in one step so no broadcast can slip
    /// between them.
    fn subscribe(
        &mut self,
        topic: &str,
        subscriber: Subscriber,
        last_seen_version: Option<u64>,
        request_ref: Option<String>,
    ) -> Result<(), EngineError> {
        if topic != self.timer.topic() {
            return Err(EngineError::Validation(RejectReason::UnknownTopic));
        }
        self.registry.subscribe(topic, subscriber.clone())?;

        let snapshot = self.scheduler.snapshot();
        let now = self.clock.now_ms();
        let mut frames = vec![ServerMessage::Subscribed {
            round_topic: topic.to_string(),
            round_id: snapshot.round_id,
            version: snapshot.version,
            request_ref,
        }];

        // Replay only what a reconnecting client has not seen yet.
        if last_seen_version.map_or(true, |seen| seen < snapshot.version) {
            frames.push(TimerBroadcaster::transition_message(&snapshot, now));
            let round = self.scheduler.current();
            if snapshot.phase == Phase::Resolving {
                if let (Some(outcome), Some(source)) =
                    (round.winning_outcome.clone(), round.resolution_source)
                {
                    frames.push(ServerMessage::RoundResolved {
                        round_id: round.id,
                        winning_outcome: outcome,
                        resolution_source: source,
                    });
                }
            }
        }

        for frame in frames {
            if subscriber.try_deliver(Arc::new(frame)).is_err() {
                return self.drop_lagging(topic, &subscriber);
            }
        }
        if self.timer.resync(&snapshot, &subscriber).is_err() {
            return self.drop_lagging(topic, &subscriber);
        }
        Ok(())
    }

    fn drop_lagging(&self, topic: &str, subscriber: &Subscriber) -> Result<(), EngineError> {
        warn!(
            "Connection {} could not take its resync frames",
            subscriber.connection_id
        );
        self.registry.unsubscribe(topic, subscriber.connection_id);
        subscriber.evict();
        Err(EngineError::Protocol(RejectReason::SubscriberLagging))
    }

    fn spawn_archive(&self, archived: Arc<ArchivedRound>) {
        let ledger = Arc::clone(&self.ledger);
        let timeout = self.archive_timeout;
        tokio::spawn(async move {
            let round_id = archived.round.id;
            match tokio::time::timeout(timeout, ledger.archive(&archived)).await {
                Ok(Ok(())) => debug!("Archived round {}", round_id),
                Ok(Err(e)) => error!("Failed to archive round {}: {}", round_id, e),
                Err(_) => warn!("Archiving round {} timed out", round_id),
            }
        });
    }
}
