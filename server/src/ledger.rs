//! Wallet and persistence collaborator.
//!
//! The engine only needs three things from the outside world: take a stake
//! before acknowledging a bet, give it back when the bet could not be kept,
//! and receive completed rounds for accounting. Every call is made under a
//! bounded timeout by the caller.

use crate::error::LedgerError;
use crate::round::{ArchivedRound, Bet, RoundId};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Debits `bet.amount` from the player's balance.
    async fn debit(&self, bet: &Bet) -> Result<(), LedgerError>;

    /// Undoes the debit made for `bet`. Idempotent by bet id: reversing a bet
    /// that was never debited, or was already reversed, succeeds.
    async fn reverse_debit(&self, bet: &Bet) -> Result<(), LedgerError>;

    async fn archive(&self, round: &ArchivedRound) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, u64>,
    /// bet id -> (player, amount) for debits that have not been reversed.
    open_debits: HashMap<u64, (String, u64)>,
    archived: Vec<RoundId>,
}

/// In-process ledger used by the demo binary and tests.
///
/// Unknown players start with `starting_balance`. Latency and availability
/// can be adjusted at runtime to exercise the engine's timeout paths.
#[derive(Debug)]
pub struct InMemoryLedger {
    starting_balance: u64,
    state: Mutex<LedgerState>,
    latency_ms: AtomicU64,
    available: AtomicBool,
}

impl InMemoryLedger {
    pub fn new(starting_balance: u64) -> Self {
        Self {
            starting_balance,
            state: Mutex::new(LedgerState::default()),
            latency_ms: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn balance(&self, player_id: &str) -> u64 {
        self.state
            .lock()
            .balances
            .get(player_id)
            .copied()
            .unwrap_or(self.starting_balance)
    }

    pub fn archived_rounds(&self) -> Vec<RoundId> {
        self.state.lock().archived.clone()
    }

    async fn simulate_io(&self) -> Result<(), LedgerError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn debit(&self, bet: &Bet) -> Result<(), LedgerError> {
        self.simulate_io().await?;

        let mut state = self.state.lock();
        if state.open_debits.contains_key(&bet.bet_id) {
            return Ok(());
        }

        let starting_balance = self.starting_balance;
        let balance = state
            .balances
            .entry(bet.player_id.clone())
            .or_insert(starting_balance);
        if *balance < bet.amount {
            return Err(LedgerError::InsufficientFunds {
                balance: *balance,
                requested: bet.amount,
            });
        }
        *balance -= bet.amount;
        state
            .open_debits
            .insert(bet.bet_id, (bet.player_id.clone(), bet.amount));
        Ok(())
    }

    async fn reverse_debit(&self, bet: &Bet) -> Result<(), LedgerError> {
        self.simulate_io().await?;

        let mut state = self.state.lock();
        if let Some((player_id, amount)) = state.open_debits.remove(&bet.bet_id) {
            *state.balances.entry(player_id).or_insert(0) += amount;
            debug!("Reversed debit for bet {}", bet.bet_id);
        }
        Ok(())
    }

    async fn archive(&self, round: &ArchivedRound) -> Result<(), LedgerError> {
        self.simulate_io().await?;

        let mut state = self.state.lock();
        if !state.archived.contains(&round.round.id) {
            state.archived.push(round.round.id);
        }
        Ok(())
    }
}
