//! Privileged override sub-protocol.
//!
//! Only sessions authenticated as admins at handshake time may submit or
//! withdraw a selection. The channel checks who is asking and what they ask
//! for; whether the window is open and the version current is decided by the
//! scheduler, at the moment the command is serialized.

use crate::auth::Identity;
use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::round::{AdminSelection, RoundId};
use shared::{Outcome, RejectReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRequest {
    pub round_id: RoundId,
    pub outcome: String,
    pub round_version: u64,
    pub received_at: u64,
}

/// What the admin is told after an accepted submission or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionAck {
    pub round_id: RoundId,
    /// `None` after a withdrawal.
    pub outcome: Option<Outcome>,
    pub version: u64,
}

pub struct AdminOverrideChannel {
    outcomes: Vec<Outcome>,
    engine: EngineHandle,
}

impl AdminOverrideChannel {
    pub fn new(outcomes: Vec<Outcome>, engine: EngineHandle) -> Self {
        Self { outcomes, engine }
    }

    pub async fn select_outcome(
        &self,
        identity: &Identity,
        request: OverrideRequest,
    ) -> Result<SelectionAck, EngineError> {
        let admin = require_admin(identity)?;

        let outcome = Outcome::new(&request.outcome);
        if !self.outcomes.contains(&outcome) {
            return Err(EngineError::Validation(RejectReason::InvalidOutcome));
        }

        let selection = AdminSelection {
            round_id: request.round_id,
            admin_identity: admin.to_string(),
            chosen_outcome: outcome.clone(),
            submitted_at: request.received_at,
            round_version_at_submit: request.round_version,
        };
        let version = self.engine.select_outcome(selection).await?;

        Ok(SelectionAck {
            round_id: request.round_id,
            outcome: Some(outcome),
            version,
        })
    }

    pub async fn withdraw_selection(
        &self,
        identity: &Identity,
        round_id: RoundId,
        round_version: u64,
        received_at: u64,
    ) -> Result<SelectionAck, EngineError> {
        let admin = require_admin(identity)?;

        let version = self
            .engine
            .withdraw_selection(admin.to_string(), round_id, round_version, received_at)
            .await?;

        Ok(SelectionAck {
            round_id,
            outcome: None,
            version,
        })
    }
}

fn require_admin(identity: &Identity) -> Result<&str, EngineError> {
    match identity {
        Identity::Admin(name) => Ok(name.as_str()),
        _ => Err(EngineError::Validation(RejectReason::Unauthorized)),
    }
}
