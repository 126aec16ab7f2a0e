//! Result resolution.
//!
//! The resolver runs exactly once per round, on the `LOCKED -> RESOLVING`
//! transition. A valid admin selection frozen at the lock wins; otherwise the
//! configured default policy picks the outcome.

use crate::config::{DefaultPolicyKind, ResolverConfig};
use crate::error::EngineError;
use crate::round::{Resolution, Round};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::{Outcome, Phase, ResolutionSource};
use std::collections::HashMap;

/// Total amount staked per outcome for one round.
pub type OutcomeStakes = HashMap<Outcome, u64>;

/// Unattended outcome selection, used when no admin override is pending.
pub trait DefaultPolicy: Send {
    fn name(&self) -> &'static str;

    /// Picks one of `outcomes`. Returns `None` only for an empty set.
    fn choose(&mut self, outcomes: &[Outcome], stakes: &OutcomeStakes) -> Option<Outcome>;
}

/// Every outcome is equally likely regardless of the bets placed.
pub struct UniformRandom {
    rng: StdRng,
}

impl UniformRandom {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl DefaultPolicy for UniformRandom {
    fn name(&self) -> &'static str {
        "uniform_random"
    }

    fn choose(&mut self, outcomes: &[Outcome], _stakes: &OutcomeStakes) -> Option<Outcome> {
        outcomes.choose(&mut self.rng).cloned()
    }
}

/// Outcome with the smallest total stake; ties go to the earliest configured outcome.
pub struct LeastWagered;

impl DefaultPolicy for LeastWagered {
    fn name(&self) -> &'static str {
        "least_wagered"
    }

    fn choose(&mut self, outcomes: &[Outcome], stakes: &OutcomeStakes) -> Option<Outcome> {
        // min_by_key keeps the first minimum, which gives the tie-break.
        outcomes
            .iter()
            .min_by_key(|outcome| stakes.get(*outcome).copied().unwrap_or(0))
            .cloned()
    }
}

pub fn policy_from_config(config: &ResolverConfig) -> Box<dyn DefaultPolicy> {
    match config.default_policy {
        DefaultPolicyKind::UniformRandom => Box::new(UniformRandom::new(config.seed)),
        DefaultPolicyKind::LeastWagered => Box::new(LeastWagered),
    }
}

pub struct ResultResolver {
    outcomes: Vec<Outcome>,
    policy: Box<dyn DefaultPolicy>,
}

impl ResultResolver {
    pub fn new(outcomes: Vec<Outcome>, policy: Box<dyn DefaultPolicy>) -> Self {
        Self { outcomes, policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Decides the outcome for `round`, which must be in `Resolving` and unresolved.
    pub fn resolve(
        &mut self,
        round: &Round,
        stakes: &OutcomeStakes,
    ) -> Result<Resolution, EngineError> {
        if round.winning_outcome.is_some() {
            return Err(EngineError::FatalInternal(format!(
                "round {} already resolved",
                round.id
            )));
        }
        if round.phase != Phase::Resolving {
            return Err(EngineError::FatalInternal(format!(
                "round {} resolved in phase {}",
                round.id, round.phase
            )));
        }

        if let Some(selection) = &round.locked_selection {
            if selection.round_id == round.id && self.outcomes.contains(&selection.chosen_outcome) {
                return Ok(Resolution {
                    outcome: selection.chosen_outcome.clone(),
                    source: ResolutionSource::AdminOverride,
                });
            }
            debug!(
                "Ignoring invalid locked selection for round {} by {}",
                round.id, selection.admin_identity
            );
        }

        let outcome = self
            .policy
            .choose(&self.outcomes, stakes)
            .ok_or_else(|| EngineError::FatalInternal("outcome set is empty".to_string()))?;

        Ok(Resolution {
            outcome,
            source: ResolutionSource::DefaultPolicy,
        })
    }
}
