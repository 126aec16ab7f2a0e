//! Client-side round countdown
//!
//! The server only sends remaining-time ticks about once a second. Between
//! ticks the client interpolates the countdown from the last anchor using a
//! local monotonic clock, and every new tick replaces the anchor so local
//! drift never accumulates.

use shared::{Outcome, Phase, ResolutionSource, ServerMessage};

/// Last resolved round as reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub round_id: u64,
    pub winning_outcome: Outcome,
    pub resolution_source: ResolutionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    round_id: u64,
    phase: Phase,
    version: u64,
    remaining_ms: u64,
    /// Local clock reading when the anchor was taken
    local_ms: u64,
}

/// Interpolated view of the server's round state
#[derive(Debug, Clone, Default)]
pub struct RoundClock {
    anchor: Option<Anchor>,
    /// Remaining time announced when the current phase began
    phase_length_ms: u64,
    /// `server_time_ms - local_ms` of the latest anchor
    server_offset_ms: i64,
    last_result: Option<RoundResult>,
}

impl RoundClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a server message into the clock
    ///
    /// Returns true if the message changed the clock's state. Round events
    /// stamped with a version older than the current anchor are ignored.
    pub fn apply(&mut self, message: &ServerMessage, local_ms: u64) -> bool {
        match message {
            ServerMessage::TimerTick {
                round_id,
                phase,
                remaining_ms,
                version,
                server_time_ms,
            } => {
                if self.is_stale(*version) {
                    return false;
                }
                let phase_started = self.anchor.map(|a| (a.round_id, a.phase)) != Some((*round_id, *phase));
                if phase_started {
                    self.phase_length_ms = *remaining_ms;
                }
                self.set_anchor(*round_id, *phase, *version, *remaining_ms, *server_time_ms, local_ms);
                true
            }
            ServerMessage::PhaseChanged {
                round_id,
                new_phase,
                remaining_ms,
                version,
                server_time_ms,
                ..
            } => {
                if self.is_stale(*version) {
                    return false;
                }
                self.phase_length_ms = *remaining_ms;
                self.set_anchor(*round_id, *new_phase, *version, *remaining_ms, *server_time_ms, local_ms);
                true
            }
            ServerMessage::RoundResolved {
                round_id,
                winning_outcome,
                resolution_source,
            } => {
                if let Some(result) = &self.last_result {
                    if result.round_id >= *round_id {
                        return false;
                    }
                }
                self.last_result = Some(RoundResult {
                    round_id: *round_id,
                    winning_outcome: winning_outcome.clone(),
                    resolution_source: *resolution_source,
                });
                true
            }
            _ => false,
        }
    }

    fn is_stale(&self, version: u64) -> bool {
        self.anchor.map_or(false, |anchor| version < anchor.version)
    }

    fn set_anchor(
        &mut self,
        round_id: u64,
        phase: Phase,
        version: u64,
        remaining_ms: u64,
        server_time_ms: u64,
        local_ms: u64,
    ) {
        self.anchor = Some(Anchor {
            round_id,
            phase,
            version,
            remaining_ms,
            local_ms,
        });
        self.server_offset_ms = server_time_ms as i64 - local_ms as i64;
    }

    /// Countdown at `local_ms`, never below zero
    pub fn remaining_ms(&self, local_ms: u64) -> u64 {
        match self.anchor {
            Some(anchor) => {
                let elapsed = local_ms.saturating_sub(anchor.local_ms);
                anchor.remaining_ms.saturating_sub(elapsed)
            }
            None => 0,
        }
    }

    /// Fraction of the current phase already elapsed, in `[0, 1]`
    pub fn progress(&self, local_ms: u64) -> f32 {
        if self.phase_length_ms == 0 {
            return 0.0;
        }
        let remaining = self.remaining_ms(local_ms).min(self.phase_length_ms);
        1.0 - remaining as f32 / self.phase_length_ms as f32
    }

    pub fn round_id(&self) -> Option<u64> {
        self.anchor.map(|anchor| anchor.round_id)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.anchor.map(|anchor| anchor.phase)
    }

    pub fn version(&self) -> Option<u64> {
        self.anchor.map(|anchor| anchor.version)
    }

    /// Estimated server clock minus local clock, from the latest anchor
    pub fn server_offset_ms(&self) -> i64 {
        self.server_offset_ms
    }

    pub fn last_result(&self) -> Option<&RoundResult> {
        self.last_result.as_ref()
    }
}
