use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_TOPIC: &str = "color-round";

/// Lifecycle stage of a round. Variants are declared in lifecycle order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BettingOpen,
    Locked,
    Resolving,
    Completed,
}

impl Phase {
    /// The phase that follows this one within the same round.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::BettingOpen => Some(Phase::Locked),
            Phase::Locked => Some(Phase::Resolving),
            Phase::Resolving => Some(Phase::Completed),
            Phase::Completed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::BettingOpen => "betting_open",
            Phase::Locked => "locked",
            Phase::Resolving => "resolving",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A round result label. Labels are case-insensitive and stored lowercase.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Outcome(String);

impl Outcome {
    pub fn new(label: &str) -> Self {
        Outcome(label.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    AdminOverride,
    DefaultPolicy,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::AdminOverride => f.write_str("admin_override"),
            ResolutionSource::DefaultPolicy => f.write_str("default_policy"),
        }
    }
}

/// Coarse error class reported with every rejection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Validation,
    WindowClosed,
    StaleVersion,
    RateLimited,
    DependencyTimeout,
    FatalInternal,
}

/// Machine-readable reason carried by `rejected` and `closing` frames.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MalformedMessage,
    MessageTooLarge,
    OriginNotAllowed,
    HeartbeatTimeout,
    TooManyStrikes,
    SubscriberLagging,
    ServerShutdown,
    ServerFull,
    InvalidOutcome,
    InvalidAmount,
    InvalidIdentity,
    Unauthorized,
    UnknownTopic,
    UnknownRound,
    DuplicateBet,
    InsufficientFunds,
    BettingClosed,
    OverrideWindowNotOpen,
    OverrideWindowClosed,
    StaleVersion,
    RateLimited,
    DependencyTimeout,
    DependencyUnavailable,
    Internal,
}

impl RejectReason {
    pub fn kind(self) -> ErrorKind {
        use RejectReason::*;
        match self {
            MalformedMessage | MessageTooLarge | OriginNotAllowed | HeartbeatTimeout
            | TooManyStrikes | SubscriberLagging | ServerShutdown | ServerFull => ErrorKind::Protocol,
            InvalidOutcome | InvalidAmount | InvalidIdentity | Unauthorized | UnknownTopic
            | UnknownRound | DuplicateBet | InsufficientFunds => ErrorKind::Validation,
            BettingClosed | OverrideWindowNotOpen | OverrideWindowClosed => {
                ErrorKind::WindowClosed
            }
            StaleVersion => ErrorKind::StaleVersion,
            RateLimited => ErrorKind::RateLimited,
            DependencyTimeout | DependencyUnavailable => ErrorKind::DependencyTimeout,
            Internal => ErrorKind::FatalInternal,
        }
    }

    pub fn as_str(self) -> &'static str {
        use RejectReason::*;
        match self {
            MalformedMessage => "malformed_message",
            MessageTooLarge => "message_too_large",
            OriginNotAllowed => "origin_not_allowed",
            HeartbeatTimeout => "heartbeat_timeout",
            TooManyStrikes => "too_many_strikes",
            SubscriberLagging => "subscriber_lagging",
            ServerShutdown => "server_shutdown",
            ServerFull => "server_full",
            InvalidOutcome => "invalid_outcome",
            InvalidAmount => "invalid_amount",
            InvalidIdentity => "invalid_identity",
            Unauthorized => "unauthorized",
            UnknownTopic => "unknown_topic",
            UnknownRound => "unknown_round",
            DuplicateBet => "duplicate_bet",
            InsufficientFunds => "insufficient_funds",
            BettingClosed => "betting_closed",
            OverrideWindowNotOpen => "override_window_not_open",
            OverrideWindowClosed => "override_window_closed",
            StaleVersion => "stale_version",
            RateLimited => "rate_limited",
            DependencyTimeout => "dependency_timeout",
            DependencyUnavailable => "dependency_unavailable",
            Internal => "internal",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        round_topic: String,
        #[serde(default)]
        last_seen_version: Option<u64>,
        #[serde(default)]
        request_ref: Option<String>,
    },
    Unsubscribe {
        round_topic: String,
        #[serde(default)]
        request_ref: Option<String>,
    },
    PlaceBet {
        round_id: u64,
        outcome: String,
        amount: u64,
        #[serde(default)]
        request_ref: Option<String>,
    },
    SelectOutcome {
        round_id: u64,
        outcome: String,
        round_version: u64,
        #[serde(default)]
        request_ref: Option<String>,
    },
    WithdrawSelection {
        round_id: u64,
        round_version: u64,
        #[serde(default)]
        request_ref: Option<String>,
    },
    Ping {
        nonce: u64,
    },
    History {
        limit: u32,
        #[serde(default)]
        request_ref: Option<String>,
    },
}

impl ClientMessage {
    pub fn request_ref(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { request_ref, .. }
            | ClientMessage::Unsubscribe { request_ref, .. }
            | ClientMessage::PlaceBet { request_ref, .. }
            | ClientMessage::SelectOutcome { request_ref, .. }
            | ClientMessage::WithdrawSelection { request_ref, .. }
            | ClientMessage::History { request_ref, .. } => request_ref.as_deref(),
            ClientMessage::Ping { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoundSummary {
    pub round_id: u64,
    pub winning_outcome: Outcome,
    pub resolution_source: ResolutionSource,
    pub completed_at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        round_topic: String,
        round_id: u64,
        version: u64,
        request_ref: Option<String>,
    },
    Unsubscribed {
        round_topic: String,
        request_ref: Option<String>,
    },
    TimerTick {
        round_id: u64,
        phase: Phase,
        remaining_ms: u64,
        version: u64,
        server_time_ms: u64,
    },
    PhaseChanged {
        round_id: u64,
        new_phase: Phase,
        deadline: u64,
        remaining_ms: u64,
        version: u64,
        server_time_ms: u64,
    },
    RoundResolved {
        round_id: u64,
        winning_outcome: Outcome,
        resolution_source: ResolutionSource,
    },
    BetAccepted {
        request_ref: Option<String>,
        bet_id: u64,
        round_id: u64,
        outcome: Outcome,
        amount: u64,
    },
    SelectionAccepted {
        request_ref: Option<String>,
        round_id: u64,
        outcome: Option<Outcome>,
        version: u64,
    },
    Rejected {
        request_ref: Option<String>,
        kind: ErrorKind,
        reason_code: RejectReason,
        message: String,
    },
    Pong {
        nonce: u64,
        server_time_ms: u64,
    },
    History {
        rounds: Vec<RoundSummary>,
    },
    Closing {
        reason_code: RejectReason,
    },
}

impl ServerMessage {
    /// Version stamp of round-stream events; `None` for direct replies.
    pub fn version(&self) -> Option<u64> {
        match self {
            ServerMessage::TimerTick { version, .. } | ServerMessage::PhaseChanged { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary codec: {0}")]
    Binary(#[from] bincode::Error),
}

/// An encoded frame body, independent of the transport that carries it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Wire encoding of a session. Text frames carry JSON, binary frames bincode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Binary,
}

impl Codec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Payload, CodecError> {
        match self {
            Codec::Json => Ok(Payload::Text(serde_json::to_string(value)?)),
            Codec::Binary => Ok(Payload::Binary(bincode::serialize(value)?)),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::Binary => Ok(bincode::deserialize(data)?),
        }
    }
}
