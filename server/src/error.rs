//! Error types for the round engine.
//!
//! [`EngineError`] is the rejection taxonomy: every variant is recovered at
//! the operation boundary and turned into a `rejected` frame for the
//! originating connection. [`ServerError`] covers start-up and I/O failures,
//! the only errors allowed to reach `main`.

use shared::{ErrorKind, RejectReason};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed frame, oversized message, bad origin.
    #[error("protocol violation ({0})")]
    Protocol(RejectReason),

    /// Well-formed request with invalid content.
    #[error("validation failed ({0})")]
    Validation(RejectReason),

    /// Request arrived outside the phase or sub-window that accepts it.
    #[error("window closed ({0})")]
    WindowClosed(RejectReason),

    #[error("stale round version {submitted}, current is {current}")]
    StaleVersion { submitted: u64, current: u64 },

    #[error("rate limit exceeded")]
    RateLimited,

    /// External collaborator timed out or was unreachable.
    #[error("dependency failed ({0})")]
    DependencyTimeout(RejectReason),

    /// Invariant violation. The operation is refused, state is left untouched.
    #[error("internal invariant violated: {0}")]
    FatalInternal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::WindowClosed(_) => ErrorKind::WindowClosed,
            EngineError::StaleVersion { .. } => ErrorKind::StaleVersion,
            EngineError::RateLimited => ErrorKind::RateLimited,
            EngineError::DependencyTimeout(_) => ErrorKind::DependencyTimeout,
            EngineError::FatalInternal(_) => ErrorKind::FatalInternal,
        }
    }

    pub fn reason(&self) -> RejectReason {
        match self {
            EngineError::Protocol(reason)
            | EngineError::Validation(reason)
            | EngineError::WindowClosed(reason)
            | EngineError::DependencyTimeout(reason) => *reason,
            EngineError::StaleVersion { .. } => RejectReason::StaleVersion,
            EngineError::RateLimited => RejectReason::RateLimited,
            EngineError::FatalInternal(_) => RejectReason::Internal,
        }
    }

    /// Whether this rejection counts as a strike against the session.
    pub fn is_abuse(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol(_) | EngineError::RateLimited
        )
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("round engine stopped")]
    EngineStopped,
}

/// Failures reported by the wallet / persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { .. } => {
                EngineError::Validation(RejectReason::InsufficientFunds)
            }
            LedgerError::Unavailable(_) => {
                EngineError::DependencyTimeout(RejectReason::DependencyUnavailable)
            }
        }
    }
}
