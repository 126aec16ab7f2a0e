//! Round data model.
//!
//! A [`Round`] is mutated only by the scheduler. Everything other components
//! read about the current round comes from a [`RoundSnapshot`], a small `Copy`
//! value whose deadlines are fixed at round creation and never change.

use crate::config::ScheduleConfig;
use crate::error::EngineError;
use shared::{Outcome, Phase, ResolutionSource, RoundSummary};
use std::collections::VecDeque;
use std::sync::Arc;

pub type RoundId = u64;

/// Absolute deadlines of one round, derived once from the phase durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSchedule {
    pub opened_at: u64,
    pub override_opens_at: u64,
    pub betting_closes_at: u64,
    pub resolves_at: u64,
    pub completes_at: u64,
}

impl RoundSchedule {
    pub fn starting_at(opened_at: u64, durations: &ScheduleConfig) -> Self {
        let betting_closes_at = opened_at + durations.betting_ms;
        let resolves_at = betting_closes_at + durations.lock_ms;
        Self {
            opened_at,
            override_opens_at: betting_closes_at - durations.override_window_ms,
            betting_closes_at,
            resolves_at,
            completes_at: resolves_at + durations.result_ms,
        }
    }

    /// Instant at which `phase` ends and its successor begins.
    pub fn deadline(&self, phase: Phase) -> u64 {
        match phase {
            Phase::BettingOpen => self.betting_closes_at,
            Phase::Locked => self.resolves_at,
            Phase::Resolving | Phase::Completed => self.completes_at,
        }
    }

    pub fn phase_at(&self, now: u64) -> Phase {
        if now < self.betting_closes_at {
            Phase::BettingOpen
        } else if now < self.resolves_at {
            Phase::Locked
        } else if now < self.completes_at {
            Phase::Resolving
        } else {
            Phase::Completed
        }
    }
}

/// Read-only view of the current round published after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub phase: Phase,
    pub version: u64,
    pub schedule: RoundSchedule,
}

impl RoundSnapshot {
    pub fn deadline(&self) -> u64 {
        self.schedule.deadline(self.phase)
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.deadline().saturating_sub(now)
    }
}

/// One accepted wager. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub bet_id: u64,
    pub round_id: RoundId,
    pub player_id: String,
    pub chosen_outcome: Outcome,
    pub amount: u64,
    /// Server receipt time.
    pub submitted_at: u64,
}

/// Candidate result submitted by an operator during the override window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSelection {
    pub round_id: RoundId,
    pub admin_identity: String,
    pub chosen_outcome: Outcome,
    pub submitted_at: u64,
    pub round_version_at_submit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    pub source: ResolutionSource,
}

#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub phase: Phase,
    pub version: u64,
    pub schedule: RoundSchedule,
    pub winning_outcome: Option<Outcome>,
    pub resolution_source: Option<ResolutionSource>,
    /// Selection frozen at the lock, consumed by the resolver.
    pub locked_selection: Option<AdminSelection>,
}

impl Round {
    pub fn open(id: RoundId, version: u64, schedule: RoundSchedule) -> Self {
        Self {
            id,
            phase: Phase::BettingOpen,
            version,
            schedule,
            winning_outcome: None,
            resolution_source: None,
            locked_selection: None,
        }
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.id,
            phase: self.phase,
            version: self.version,
            schedule: self.schedule,
        }
    }

    /// Moves to `next`, which must be the immediate successor of the current
    /// phase, and stamps the new version.
    pub fn advance_to(&mut self, next: Phase, version: u64) -> Result<(), EngineError> {
        if self.phase.next() != Some(next) {
            return Err(EngineError::FatalInternal(format!(
                "round {} cannot move from {} to {}",
                self.id, self.phase, next
            )));
        }
        if version <= self.version {
            return Err(EngineError::FatalInternal(format!(
                "round {} version must increase ({} -> {})",
                self.id, self.version, version
            )));
        }
        self.phase = next;
        self.version = version;
        Ok(())
    }

    /// Writes the result. Allowed once, in `Resolving`, at the expected version.
    pub fn record_resolution(
        &mut self,
        resolution: Resolution,
        expected_version: u64,
    ) -> Result<(), EngineError> {
        if self.winning_outcome.is_some() {
            return Err(EngineError::FatalInternal(format!(
                "round {} is already resolved",
                self.id
            )));
        }
        if expected_version != self.version {
            return Err(EngineError::StaleVersion {
                submitted: expected_version,
                current: self.version,
            });
        }
        if self.phase != Phase::Resolving {
            return Err(EngineError::FatalInternal(format!(
                "round {} cannot be resolved in phase {}",
                self.id, self.phase
            )));
        }
        self.winning_outcome = Some(resolution.outcome);
        self.resolution_source = Some(resolution.source);
        Ok(())
    }
}

/// A completed round as handed to the archive. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct ArchivedRound {
    pub round: Round,
    pub bets: Vec<Bet>,
}

impl ArchivedRound {
    pub fn summary(&self) -> Option<RoundSummary> {
        Some(RoundSummary {
            round_id: self.round.id,
            winning_outcome: self.round.winning_outcome.clone()?,
            resolution_source: self.round.resolution_source?,
            completed_at: self.round.schedule.completes_at,
        })
    }
}

/// Bounded append-only log of completed rounds, oldest evicted first.
#[derive(Debug)]
pub struct RoundHistory {
    capacity: usize,
    rounds: VecDeque<Arc<ArchivedRound>>,
}

impl RoundHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rounds: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, round: Arc<ArchivedRound>) {
        if self.rounds.len() == self.capacity {
            self.rounds.pop_front();
        }
        self.rounds.push_back(round);
    }

    pub fn get(&self, round_id: RoundId) -> Option<Arc<ArchivedRound>> {
        self.rounds
            .iter()
            .find(|archived| archived.round.id == round_id)
            .cloned()
    }

    /// Most recent summaries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RoundSummary> {
        self.rounds
            .iter()
            .rev()
            .take(limit)
            .filter_map(|archived| archived.summary())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
