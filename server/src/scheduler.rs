//! Round phase state machine.
//!
//! [`RoundScheduler`] is the only writer of round state. It is a plain
//! synchronous struct driven by explicit timestamps: the engine task calls
//! [`RoundScheduler::advance`] with the current time before handling anything
//! else, so "deadline passed" and "admin submitted" can never interleave.
//! Transitions depend only on deadlines fixed when the round opened, never on
//! when a message happened to arrive.

use crate::config::ScheduleConfig;
use crate::error::EngineError;
use crate::intake::BetBook;
use crate::resolver::ResultResolver;
use crate::round::{
    AdminSelection, ArchivedRound, Resolution, Round, RoundId, RoundSchedule, RoundSnapshot,
};
use log::{error, info, warn};
use shared::{Phase, RejectReason};
use std::sync::Arc;

/// Something every subscriber of the round topic must learn about, in order.
#[derive(Debug, Clone)]
pub enum RoundEvent {
    PhaseChanged(RoundSnapshot),
    Resolved {
        round_id: RoundId,
        resolution: Resolution,
    },
    Archived(Arc<ArchivedRound>),
}

pub struct RoundScheduler {
    durations: ScheduleConfig,
    current: Round,
    /// Latest accepted admin selection for the current round.
    pending: Option<AdminSelection>,
    resolver: ResultResolver,
    book: Arc<BetBook>,
    last_version: u64,
}

impl RoundScheduler {
    /// Opens round 1 at `now`.
    pub fn new(
        durations: ScheduleConfig,
        resolver: ResultResolver,
        book: Arc<BetBook>,
        now: u64,
    ) -> Self {
        let schedule = RoundSchedule::starting_at(now, &durations);
        book.open_round(1);
        info!(
            "Round 1 open, betting closes at {} (policy {})",
            schedule.betting_closes_at,
            resolver.policy_name()
        );

        Self {
            durations,
            current: Round::open(1, 1, schedule),
            pending: None,
            resolver,
            book,
            last_version: 1,
        }
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        self.current.snapshot()
    }

    pub fn current(&self) -> &Round {
        &self.current
    }

    pub fn pending_selection(&self) -> Option<&AdminSelection> {
        self.pending.as_ref()
    }

    /// When the current phase ends.
    pub fn next_deadline(&self) -> u64 {
        self.current.schedule.deadline(self.current.phase)
    }

    /// Fires every transition whose deadline is at or before `now`, oldest
    /// first, and returns the resulting events in emission order.
    pub fn advance(&mut self, now: u64) -> Vec<RoundEvent> {
        let mut events = Vec::new();

        loop {
            let phase = self.current.phase;
            if phase != Phase::Completed && now < self.next_deadline() {
                break;
            }

            let step = match phase {
                Phase::BettingOpen => self.lock(&mut events),
                Phase::Locked => self.resolve(&mut events),
                Phase::Resolving => self.complete(&mut events),
                Phase::Completed => self.open_next(now, &mut events),
            };

            if let Err(e) = step {
                error!("Round {} stuck in {}: {}", self.current.id, phase, e);
                break;
            }
        }

        events
    }

    /// Records `selection` as the pending override, replacing any earlier one.
    pub fn select_outcome(&mut self, selection: AdminSelection) -> Result<(), EngineError> {
        self.check_override(
            selection.round_id,
            selection.round_version_at_submit,
            selection.submitted_at,
        )?;

        match &self.pending {
            Some(previous) => info!(
                "Admin {} selected {} for round {}, superseding {} from {}",
                selection.admin_identity,
                selection.chosen_outcome,
                selection.round_id,
                previous.chosen_outcome,
                previous.admin_identity
            ),
            None => info!(
                "Admin {} selected {} for round {}",
                selection.admin_identity, selection.chosen_outcome, selection.round_id
            ),
        }

        self.pending = Some(selection);
        Ok(())
    }

    /// Drops the pending override. Withdrawing when nothing is pending succeeds.
    pub fn withdraw_selection(
        &mut self,
        admin: &str,
        round_id: RoundId,
        round_version: u64,
        now: u64,
    ) -> Result<(), EngineError> {
        self.check_override(round_id, round_version, now)?;

        if let Some(previous) = self.pending.take() {
            info!(
                "Admin {} withdrew {} (submitted by {}) for round {}",
                admin, previous.chosen_outcome, previous.admin_identity, round_id
            );
        }
        Ok(())
    }

    fn check_override(&self, round_id: RoundId, round_version: u64, now: u64) -> Result<(), EngineError> {
        let round = &self.current;

        if round_id > round.id {
            return Err(EngineError::Validation(RejectReason::UnknownRound));
        }
        if round_id < round.id
            || round.phase != Phase::BettingOpen
            || now >= round.schedule.betting_closes_at
        {
            return Err(EngineError::WindowClosed(RejectReason::OverrideWindowClosed));
        }
        if now < round.schedule.override_opens_at {
            return Err(EngineError::WindowClosed(RejectReason::OverrideWindowNotOpen));
        }
        if round_version != round.version {
            return Err(EngineError::StaleVersion {
                submitted: round_version,
                current: round.version,
            });
        }
        Ok(())
    }

    fn bump_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn transition(&mut self, next: Phase, events: &mut Vec<RoundEvent>) -> Result<(), EngineError> {
        let version = self.bump_version();
        self.current.advance_to(next, version)?;
        info!(
            "Round {} -> {} (v{})",
            self.current.id, next, self.current.version
        );
        events.push(RoundEvent::PhaseChanged(self.current.snapshot()));
        Ok(())
    }

    fn lock(&mut self, events: &mut Vec<RoundEvent>) -> Result<(), EngineError> {
        let round_id = self.current.id;
        self.current.locked_selection = self
            .pending
            .take()
            .filter(|selection| selection.round_id == round_id);
        self.book.seal(round_id);
        self.transition(Phase::Locked, events)
    }

    fn resolve(&mut self, events: &mut Vec<RoundEvent>) -> Result<(), EngineError> {
        self.transition(Phase::Resolving, events)?;

        let round_id = self.current.id;
        let version = self.current.version;
        let stakes = self.book.stakes(round_id);
        let resolution = self.resolver.resolve(&self.current, &stakes).and_then(|resolution| {
            self.current
                .record_resolution(resolution.clone(), version)
                .map(|()| resolution)
        });

        // A failed resolution leaves the round unresolved; the schedule still moves on.
        match resolution {
            Ok(resolution) => {
                info!(
                    "Round {} resolved to {} ({})",
                    round_id, resolution.outcome, resolution.source
                );
                events.push(RoundEvent::Resolved {
                    round_id,
                    resolution,
                });
            }
            Err(e) => error!("Round {} could not be resolved: {}", round_id, e),
        }
        Ok(())
    }

    fn complete(&mut self, events: &mut Vec<RoundEvent>) -> Result<(), EngineError> {
        self.transition(Phase::Completed, events)?;

        let bets = self.book.take(self.current.id);
        let archived = Arc::new(ArchivedRound {
            round: self.current.clone(),
            bets,
        });
        events.push(RoundEvent::Archived(archived));
        Ok(())
    }

    fn open_next(&mut self, now: u64, events: &mut Vec<RoundEvent>) -> Result<(), EngineError> {
        let previous_end = self.current.schedule.completes_at;
        let lag = now.saturating_sub(previous_end);
        let opened_at = if lag > self.durations.betting_ms {
            warn!(
                "Engine fell {}ms behind the round schedule, re-anchoring at {}",
                lag, now
            );
            now
        } else {
            previous_end
        };

        let round_id = self.current.id + 1;
        let version = self.bump_version();
        let schedule = RoundSchedule::starting_at(opened_at, &self.durations);

        self.book.open_round(round_id);
        self.pending = None;
        self.current = Round::open(round_id, version, schedule);
        info!(
            "Round {} open (v{}), betting closes at {}",
            round_id, version, schedule.betting_closes_at
        );
        events.push(RoundEvent::PhaseChanged(self.current.snapshot()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{LeastWagered, UniformRandom};
    use crate::round::Bet;
    use shared::{Outcome, ResolutionSource};

    const T: u64 = 1_000_000;

    fn durations() -> ScheduleConfig {
        ScheduleConfig {
            betting_ms: 40_000,
            override_window_ms: 10_000,
            lock_ms: 1_000,
            result_ms: 10_000,
        }
    }

    fn outcomes() -> Vec<Outcome> {
        ["red", "green", "violet", "blue"]
            .iter()
            .map(|label| Outcome::new(label))
            .collect()
    }

    fn scheduler_with(durations: ScheduleConfig) -> (RoundScheduler, Arc<BetBook>) {
        let book = Arc::new(BetBook::default());
        let resolver = ResultResolver::new(outcomes(), Box::new(LeastWagered));
        (
            RoundScheduler::new(durations, resolver, Arc::clone(&book), T),
            book,
        )
    }

    fn scheduler() -> (RoundScheduler, Arc<BetBook>) {
        scheduler_with(durations())
    }

    fn selection(admin: &str, outcome: &str, at: u64, version: u64) -> AdminSelection {
        AdminSelection {
            round_id: 1,
            admin_identity: admin.to_string(),
            chosen_outcome: Outcome::new(outcome),
            submitted_at: at,
            round_version_at_submit: version,
        }
    }

    fn phases(events: &[RoundEvent]) -> Vec<(RoundId, Phase, u64)> {
        events
            .iter()
            .filter_map(|event| match event {
                RoundEvent::PhaseChanged(s) => Some((s.round_id, s.phase, s.version)),
                _ => None,
            })
            .collect()
    }

    fn resolutions(events: &[RoundEvent]) -> Vec<Resolution> {
        events
            .iter()
            .filter_map(|event| match event {
                RoundEvent::Resolved { resolution, .. } => Some(resolution.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_nothing_happens_before_deadline() {
        let (mut scheduler, _) = scheduler();

        assert!(scheduler.advance(T + 39_999).is_empty());
        assert_eq!(scheduler.snapshot().phase, Phase::BettingOpen);
        assert_eq!(scheduler.snapshot().version, 1);
    }

    #[test]
    fn test_phases_run_in_order_with_increasing_versions() {
        let (mut scheduler, _) = scheduler();
        let mut events = Vec::new();

        events.extend(scheduler.advance(T + 40_000));
        events.extend(scheduler.advance(T + 41_000));
        events.extend(scheduler.advance(T + 51_000));

        assert_eq!(
            phases(&events),
            vec![
                (1, Phase::Locked, 2),
                (1, Phase::Resolving, 3),
                (1, Phase::Completed, 4),
                (2, Phase::BettingOpen, 5),
            ]
        );
        assert_eq!(resolutions(&events).len(), 1);
    }

    #[test]
    fn test_catch_up_emits_every_transition_in_order() {
        let (mut scheduler, _) = scheduler();

        let events = scheduler.advance(T + 51_000);

        let kinds: Vec<&str> = events
            .iter()
            .map(|event| match event {
                RoundEvent::PhaseChanged(s) => s.phase.as_str(),
                RoundEvent::Resolved { .. } => "resolved",
                RoundEvent::Archived(_) => "archived",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "locked",
                "resolving",
                "resolved",
                "completed",
                "archived",
                "betting_open"
            ]
        );
    }

    #[test]
    fn test_zero_lock_phase_still_passes_through_locked() {
        let (mut scheduler, _) = scheduler_with(ScheduleConfig {
            lock_ms: 0,
            ..durations()
        });

        let events = scheduler.advance(T + 40_000);
        assert_eq!(
            phases(&events),
            vec![(1, Phase::Locked, 2), (1, Phase::Resolving, 3)]
        );
        assert_eq!(resolutions(&events).len(), 1);
    }

    #[test]
    fn test_next_round_is_anchored_to_previous_completion() {
        let (mut scheduler, _) = scheduler();

        scheduler.advance(T + 51_250);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.round_id, 2);
        assert_eq!(snapshot.schedule.opened_at, T + 51_000);
        assert_eq!(snapshot.schedule.betting_closes_at, T + 91_000);
    }

    #[test]
    fn test_long_stall_re_anchors_instead_of_replaying() {
        let (mut scheduler, _) = scheduler();
        let late = T + 51_000 + 40_001;

        let events = scheduler.advance(late);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.round_id, 2);
        assert_eq!(snapshot.phase, Phase::BettingOpen);
        assert_eq!(snapshot.schedule.opened_at, late);
        assert_eq!(resolutions(&events).len(), 1);
    }

    #[test]
    fn test_admin_override_supersedes_and_wins() {
        let (mut scheduler, _) = scheduler();

        scheduler
            .select_outcome(selection("ops-a", "Red", T + 35_000, 1))
            .unwrap();
        scheduler
            .select_outcome(selection("ops-b", "Blue", T + 38_000, 1))
            .unwrap();

        let events = scheduler.advance(T + 41_000);
        let resolved = resolutions(&events);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].outcome, Outcome::new("blue"));
        assert_eq!(resolved[0].source, ResolutionSource::AdminOverride);
        assert_eq!(
            scheduler.current().winning_outcome,
            Some(Outcome::new("blue"))
        );
    }

    #[test]
    fn test_override_window_boundaries() {
        let (mut scheduler, _) = scheduler();

        let err = scheduler
            .select_outcome(selection("ops", "red", T + 29_999, 1))
            .unwrap_err();
        assert_eq!(err.reason(), RejectReason::OverrideWindowNotOpen);

        scheduler
            .select_outcome(selection("ops", "red", T + 30_000, 1))
            .unwrap();

        let err = scheduler
            .select_outcome(selection("ops", "red", T + 40_000, 1))
            .unwrap_err();
        assert_eq!(err.reason(), RejectReason::OverrideWindowClosed);
    }

    #[test]
    fn test_stale_version_is_never_applied() {
        let (mut scheduler, _) = scheduler();
        scheduler.advance(T + 51_000);
        let snapshot = scheduler.snapshot();
        let in_window = snapshot.schedule.override_opens_at + 1;

        let mut stale = selection("ops", "violet", in_window, 1);
        stale.round_id = 2;
        let err = scheduler.select_outcome(stale).unwrap_err();

        assert_eq!(
            err,
            EngineError::StaleVersion {
                submitted: 1,
                current: snapshot.version
            }
        );
        assert!(scheduler.pending_selection().is_none());
    }

    #[test]
    fn test_round_ids_in_override() {
        let (mut scheduler, _) = scheduler();

        let mut future = selection("ops", "red", T + 35_000, 1);
        future.round_id = 2;
        assert_eq!(
            scheduler.select_outcome(future).unwrap_err().reason(),
            RejectReason::UnknownRound
        );

        scheduler.advance(T + 51_000);
        let past = selection("ops", "red", T + 85_000, 5);
        assert_eq!(
            scheduler.select_outcome(past).unwrap_err().reason(),
            RejectReason::OverrideWindowClosed
        );
    }

    #[test]
    fn test_withdrawn_selection_falls_back_to_default_policy() {
        let (mut scheduler, book) = scheduler();
        book.record(Bet {
            bet_id: 1,
            round_id: 1,
            player_id: "p".to_string(),
            chosen_outcome: Outcome::new("red"),
            amount: 10,
            submitted_at: T + 1,
        })
        .unwrap();

        scheduler
            .select_outcome(selection("ops", "red", T + 35_000, 1))
            .unwrap();
        scheduler
            .withdraw_selection("ops", 1, 1, T + 36_000)
            .unwrap();
        scheduler
            .withdraw_selection("ops", 1, 1, T + 36_500)
            .unwrap();

        let events = scheduler.advance(T + 41_000);
        let resolved = resolutions(&events);
        assert_eq!(resolved[0].source, ResolutionSource::DefaultPolicy);
        // Least-wagered skips the only outcome anyone bet on.
        assert_eq!(resolved[0].outcome, Outcome::new("green"));
    }

    #[test]
    fn test_no_selection_uses_default_policy_exactly_once() {
        let book = Arc::new(BetBook::default());
        let resolver = ResultResolver::new(outcomes(), Box::new(UniformRandom::new(Some(3))));
        let mut scheduler = RoundScheduler::new(durations(), resolver, book, T);

        let events = scheduler.advance(T + 41_000);
        let resolved = resolutions(&events);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].source, ResolutionSource::DefaultPolicy);
        assert!(outcomes().contains(&resolved[0].outcome));
        assert!(scheduler.advance(T + 41_500).is_empty());
    }

    #[test]
    fn test_selection_does_not_leak_into_next_round() {
        let (mut scheduler, _) = scheduler();
        scheduler
            .select_outcome(selection("ops", "violet", T + 35_000, 1))
            .unwrap();

        let mut events = scheduler.advance(T + 51_000);
        events.extend(scheduler.advance(T + 51_000 + 41_000));
        let resolved = resolutions(&events);

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].source, ResolutionSource::AdminOverride);
        assert_eq!(resolved[1].source, ResolutionSource::DefaultPolicy);
    }

    #[test]
    fn test_archive_carries_bets_and_result() {
        let (mut scheduler, book) = scheduler();
        book.record(Bet {
            bet_id: 7,
            round_id: 1,
            player_id: "p".to_string(),
            chosen_outcome: Outcome::new("blue"),
            amount: 25,
            submitted_at: T + 5,
        })
        .unwrap();

        let events = scheduler.advance(T + 51_000);
        let archived = events
            .iter()
            .find_map(|event| match event {
                RoundEvent::Archived(archived) => Some(Arc::clone(archived)),
                _ => None,
            })
            .expect("round 1 should be archived");

        assert_eq!(archived.round.id, 1);
        assert_eq!(archived.round.phase, Phase::Completed);
        assert_eq!(archived.bets.len(), 1);
        assert!(archived.summary().is_some());
        assert!(book.is_empty());
    }

    #[test]
    fn test_many_rounds_each_resolve_once() {
        let (mut scheduler, _) = scheduler();
        let round_length = durations().round_length_ms();

        let mut resolved_rounds = Vec::new();
        let mut last_version = 1;
        for step in 1..=200u64 {
            for event in scheduler.advance(T + step * round_length / 4) {
                match event {
                    RoundEvent::PhaseChanged(snapshot) => {
                        assert!(snapshot.version > last_version);
                        last_version = snapshot.version;
                    }
                    RoundEvent::Resolved { round_id, .. } => resolved_rounds.push(round_id),
                    RoundEvent::Archived(_) => {}
                }
            }
        }

        let expected: Vec<RoundId> = (1..=resolved_rounds.len() as u64).collect();
        assert_eq!(resolved_rounds, expected);
        assert_eq!(resolved_rounds.len(), 50);
    }
}
