//! Bet intake.
//!
//! Validation runs against the latest published [`RoundSnapshot`] and never
//! touches round state. Accepted bets are appended to the [`BetBook`], the
//! one collection intake may write, which the scheduler seals at the lock and
//! drains at completion.

use crate::auth::Identity;
use crate::config::BetConfig;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::resolver::OutcomeStakes;
use crate::round::{Bet, RoundId, RoundSnapshot};
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{Outcome, Phase, RejectReason};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct BookState {
    round_id: RoundId,
    sealed: bool,
    bets: Vec<Bet>,
    stakes: OutcomeStakes,
    /// Players holding a bet or an in-flight reservation (single-bet mode).
    bettors: HashSet<String>,
}

/// Append-only bet collection for the current round.
#[derive(Debug, Default)]
pub struct BetBook {
    state: Mutex<BookState>,
}

impl BetBook {
    pub fn new(round_id: RoundId) -> Self {
        Self {
            state: Mutex::new(BookState {
                round_id,
                ..BookState::default()
            }),
        }
    }

    /// Starts collecting for `round_id`, dropping anything left from before.
    pub fn open_round(&self, round_id: RoundId) {
        *self.state.lock() = BookState {
            round_id,
            ..BookState::default()
        };
    }

    /// Stops accepting bets for `round_id` and returns its per-outcome stakes.
    pub fn seal(&self, round_id: RoundId) -> OutcomeStakes {
        let mut state = self.state.lock();
        if state.round_id != round_id {
            return OutcomeStakes::new();
        }
        state.sealed = true;
        state.stakes.clone()
    }

    pub fn stakes(&self, round_id: RoundId) -> OutcomeStakes {
        let state = self.state.lock();
        if state.round_id == round_id {
            state.stakes.clone()
        } else {
            OutcomeStakes::new()
        }
    }

    /// Hands over every bet of a sealed round.
    pub fn take(&self, round_id: RoundId) -> Vec<Bet> {
        let mut state = self.state.lock();
        if state.round_id != round_id {
            return Vec::new();
        }
        std::mem::take(&mut state.bets)
    }

    /// Claims the single bet slot of `player_id` for `round_id`.
    pub fn reserve(&self, round_id: RoundId, player_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::check_open(&state, round_id)?;
        if !state.bettors.insert(player_id.to_string()) {
            return Err(EngineError::Validation(RejectReason::DuplicateBet));
        }
        Ok(())
    }

    pub fn release(&self, round_id: RoundId, player_id: &str) {
        let mut state = self.state.lock();
        if state.round_id == round_id {
            state.bettors.remove(player_id);
        }
    }

    /// Appends a debited bet. Fails if the round was sealed in the meantime.
    pub fn record(&self, bet: Bet) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::check_open(&state, bet.round_id)?;
        *state.stakes.entry(bet.chosen_outcome.clone()).or_insert(0) += bet.amount;
        state.bettors.insert(bet.player_id.clone());
        state.bets.push(bet);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(state: &BookState, round_id: RoundId) -> Result<(), EngineError> {
        if state.round_id != round_id || state.sealed {
            return Err(EngineError::WindowClosed(RejectReason::BettingClosed));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetRequest {
    pub round_id: RoundId,
    pub outcome: String,
    pub amount: u64,
    /// Server receipt time of the frame carrying the request.
    pub received_at: u64,
}

pub struct BetIntake {
    config: BetConfig,
    outcomes: Vec<Outcome>,
    snapshot: watch::Receiver<RoundSnapshot>,
    book: Arc<BetBook>,
    ledger: Arc<dyn Ledger>,
    next_bet_id: AtomicU64,
}

impl BetIntake {
    pub fn new(
        config: BetConfig,
        outcomes: Vec<Outcome>,
        snapshot: watch::Receiver<RoundSnapshot>,
        book: Arc<BetBook>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            config,
            outcomes,
            snapshot,
            book,
            ledger,
            next_bet_id: AtomicU64::new(1),
        }
    }

    /// Validates, debits and records a bet. Nothing is recorded unless the
    /// debit succeeded in time, and a debit is reversed if the bet cannot be
    /// recorded afterwards.
    pub async fn place_bet(&self, identity: &Identity, request: BetRequest) -> Result<Bet, EngineError> {
        let Identity::Player(player_id) = identity else {
            return Err(EngineError::Validation(RejectReason::Unauthorized));
        };

        let outcome = self.validate_outcome(&request.outcome)?;
        self.validate_amount(request.amount)?;
        self.validate_window(request.round_id, request.received_at)?;

        let single_bet = !self.config.allow_multiple_per_round;
        if single_bet {
            self.book.reserve(request.round_id, player_id)?;
        }

        let bet = Bet {
            bet_id: self.next_bet_id.fetch_add(1, Ordering::Relaxed),
            round_id: request.round_id,
            player_id: player_id.clone(),
            chosen_outcome: outcome,
            amount: request.amount,
            submitted_at: request.received_at,
        };

        let debit = tokio::time::timeout(self.config.ledger_timeout(), self.ledger.debit(&bet)).await;
        let failure = match debit {
            Ok(Ok(())) => match self.book.record(bet.clone()) {
                Ok(()) => {
                    debug!(
                        "Accepted bet {} from {} on {} for {}",
                        bet.bet_id, bet.player_id, bet.chosen_outcome, bet.amount
                    );
                    return Ok(bet);
                }
                Err(err) => {
                    self.spawn_reversal(bet.clone());
                    err
                }
            },
            Ok(Err(err)) => err.into(),
            Err(_) => {
                warn!(
                    "Wallet debit for bet {} timed out after {}ms",
                    bet.bet_id, self.config.ledger_timeout_ms
                );
                self.spawn_reversal(bet.clone());
                EngineError::DependencyTimeout(RejectReason::DependencyTimeout)
            }
        };

        if single_bet {
            self.book.release(bet.round_id, &bet.player_id);
        }
        Err(failure)
    }

    fn validate_outcome(&self, label: &str) -> Result<Outcome, EngineError> {
        let outcome = Outcome::new(label);
        if self.outcomes.contains(&outcome) {
            Ok(outcome)
        } else {
            Err(EngineError::Validation(RejectReason::InvalidOutcome))
        }
    }

    fn validate_amount(&self, amount: u64) -> Result<(), EngineError> {
        if amount == 0 || amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(EngineError::Validation(RejectReason::InvalidAmount));
        }
        Ok(())
    }

    fn validate_window(&self, round_id: RoundId, received_at: u64) -> Result<(), EngineError> {
        let snapshot = *self.snapshot.borrow();

        if round_id > snapshot.round_id {
            return Err(EngineError::Validation(RejectReason::UnknownRound));
        }
        if round_id < snapshot.round_id
            || snapshot.phase != Phase::BettingOpen
            || received_at >= snapshot.schedule.betting_closes_at
        {
            return Err(EngineError::WindowClosed(RejectReason::BettingClosed));
        }
        Ok(())
    }

    fn spawn_reversal(&self, bet: Bet) {
        let ledger = Arc::clone(&self.ledger);
        let timeout = self.config.ledger_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, ledger.reverse_debit(&bet)).await {
                Ok(Ok(())) => debug!("Rolled back debit for bet {}", bet.bet_id),
                Ok(Err(e)) => warn!("Failed to roll back bet {}: {}", bet.bet_id, e),
                Err(_) => warn!("Rollback of bet {} timed out", bet.bet_id),
            }
        });
    }
}
