//! Inbound middleware.
//!
//! Every frame passes an ordered list of stages before it is parsed. A stage
//! inspects the raw frame and the session and either lets it through, rejects
//! it (the session survives and collects a strike), or closes the session.
//! Origin checking runs once, at handshake time, via [`check_origin`].

use super::session::ConnectionSession;
use crate::error::EngineError;
use shared::RejectReason;

/// Raw frame as it came off the socket.
#[derive(Debug, Clone, Copy)]
pub struct InboundFrame<'a> {
    pub payload: &'a [u8],
    pub received_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject(EngineError),
    Close(RejectReason),
}

pub type Stage = fn(&InboundFrame<'_>, &mut ConnectionSession) -> Verdict;

/// Size is checked first so that oversized frames never spend rate tokens.
pub const INBOUND_STAGES: [Stage; 2] = [message_size, rate_limit];

/// Runs `stages` in order, stopping at the first non-`Allow` verdict.
pub fn run_pipeline(stages: &[Stage], frame: &InboundFrame<'_>, session: &mut ConnectionSession) -> Verdict {
    for stage in stages {
        let verdict = stage(frame, session);
        if verdict != Verdict::Allow {
            return verdict;
        }
    }
    Verdict::Allow
}

pub fn message_size(frame: &InboundFrame<'_>, session: &mut ConnectionSession) -> Verdict {
    let len = frame.payload.len();
    if len > session.limits.hard_message_bytes {
        Verdict::Close(RejectReason::MessageTooLarge)
    } else if len > session.limits.max_message_bytes {
        Verdict::Reject(EngineError::Protocol(RejectReason::MessageTooLarge))
    } else {
        Verdict::Allow
    }
}

pub fn rate_limit(frame: &InboundFrame<'_>, session: &mut ConnectionSession) -> Verdict {
    if session.try_consume_token(frame.received_at) {
        Verdict::Allow
    } else {
        Verdict::Reject(EngineError::RateLimited)
    }
}

/// Handshake origin check. A request without an Origin header comes from a
/// native client and is accepted; a browser origin must be on the list.
pub fn check_origin(origin: Option<&str>, allowed: &[String]) -> Result<(), EngineError> {
    let Some(origin) = origin else {
        return Ok(());
    };

    let origin = normalize_origin(origin);
    if allowed.iter().any(|entry| normalize_origin(entry) == origin) {
        Ok(())
    } else {
        Err(EngineError::Protocol(RejectReason::OriginNotAllowed))
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
