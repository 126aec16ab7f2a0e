//! Engine configuration.
//!
//! All tunables live here rather than as constants scattered through the
//! engine. A config is read from an optional TOML file, every section falls
//! back to its defaults, and the binary may override selected values from the
//! command line before [`EngineConfig::validate`] is called.

use crate::error::ServerError;
use serde::Deserialize;
use shared::{Outcome, DEFAULT_TOPIC};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub topic: String,
    pub outcomes: Vec<String>,
    pub schedule: ScheduleConfig,
    pub bets: BetConfig,
    pub gateway: GatewayConfig,
    pub timer: TimerConfig,
    pub resolver: ResolverConfig,
    pub history_capacity: usize,
    /// Bearer token -> admin name.
    pub admin_tokens: HashMap<String, String>,
    pub ledger: LedgerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            outcomes: ["red", "green", "violet", "blue"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            schedule: ScheduleConfig::default(),
            bets: BetConfig::default(),
            gateway: GatewayConfig::default(),
            timer: TimerConfig::default(),
            resolver: ResolverConfig::default(),
            history_capacity: 50,
            admin_tokens: HashMap::new(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Fixed phase durations. The engine derives every deadline from these.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub betting_ms: u64,
    /// Length of the admin override sub-window at the end of betting.
    pub override_window_ms: u64,
    pub lock_ms: u64,
    pub result_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            betting_ms: 40_000,
            override_window_ms: 10_000,
            lock_ms: 1_000,
            result_ms: 10_000,
        }
    }
}

impl ScheduleConfig {
    pub fn round_length_ms(&self) -> u64 {
        self.betting_ms + self.lock_ms + self.result_ms
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BetConfig {
    pub min_amount: u64,
    pub max_amount: u64,
    pub allow_multiple_per_round: bool,
    pub ledger_timeout_ms: u64,
}

impl Default for BetConfig {
    fn default() -> Self {
        Self {
            min_amount: 1,
            max_amount: 100_000,
            allow_multiple_per_round: true,
            ledger_timeout_ms: 2_000,
        }
    }
}

impl BetConfig {
    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }
}

/// Token bucket parameters for one identity class.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    /// Origins accepted at handshake. Requests without an Origin header
    /// (native clients) are always accepted.
    pub allowed_origins: Vec<String>,
    pub max_connections: usize,
    /// Soft limit: larger frames are rejected and penalised.
    pub max_message_bytes: usize,
    /// Hard limit: larger frames close the session.
    pub hard_message_bytes: usize,
    /// Time a new socket gets to complete the WebSocket upgrade.
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_strikes: u32,
    pub strike_decay_ms: u64,
    pub outbound_queue: usize,
    pub anonymous_rate: RateLimitConfig,
    pub player_rate: RateLimitConfig,
    pub admin_rate: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            allowed_origins: Vec::new(),
            max_connections: 4096,
            max_message_bytes: 10 * 1024,
            hard_message_bytes: 64 * 1024,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            max_strikes: 10,
            strike_decay_ms: 10_000,
            outbound_queue: 256,
            anonymous_rate: RateLimitConfig {
                capacity: 5,
                refill_per_sec: 5.0,
            },
            player_rate: RateLimitConfig {
                capacity: 8,
                refill_per_sec: 8.0,
            },
            admin_rate: RateLimitConfig {
                capacity: 10,
                refill_per_sec: 10.0,
            },
        }
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub broadcast_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicyKind {
    #[default]
    UniformRandom,
    LeastWagered,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct ResolverConfig {
    pub default_policy: DefaultPolicyKind,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub starting_balance: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_balance: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ServerError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Normalised outcome set, in configured order.
    pub fn outcome_set(&self) -> Vec<Outcome> {
        self.outcomes.iter().map(|label| Outcome::new(label)).collect()
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |msg: &str| -> Result<(), ServerError> {
            Err(ServerError::InvalidConfig(msg.to_string()))
        };

        if self.topic.trim().is_empty() {
            return invalid("topic must not be empty");
        }

        let outcomes = self.outcome_set();
        if outcomes.len() < 2 {
            return invalid("at least two outcomes are required");
        }
        if outcomes.iter().any(|o| o.as_str().is_empty()) {
            return invalid("outcome labels must not be empty");
        }
        let unique: HashSet<&Outcome> = outcomes.iter().collect();
        if unique.len() != outcomes.len() {
            return invalid("outcome labels must be unique (case-insensitive)");
        }

        let schedule = &self.schedule;
        if schedule.betting_ms == 0 || schedule.result_ms == 0 {
            return invalid("betting_ms and result_ms must be positive");
        }
        if schedule.override_window_ms > schedule.betting_ms {
            return invalid("override_window_ms cannot exceed betting_ms");
        }

        let bets = &self.bets;
        if bets.min_amount == 0 || bets.min_amount > bets.max_amount {
            return invalid("bet bounds must satisfy 0 < min_amount <= max_amount");
        }
        if bets.ledger_timeout_ms == 0 || bets.ledger_timeout_ms >= schedule.result_ms {
            return invalid("ledger_timeout_ms must be positive and shorter than result_ms");
        }

        let gateway = &self.gateway;
        if gateway.max_message_bytes == 0 || gateway.max_message_bytes > gateway.hard_message_bytes
        {
            return invalid("message limits must satisfy 0 < max_message_bytes <= hard_message_bytes");
        }
        if gateway.handshake_timeout_ms == 0 {
            return invalid("handshake_timeout_ms must be positive");
        }
        if gateway.heartbeat_interval_ms == 0
            || gateway.heartbeat_timeout_ms <= gateway.heartbeat_interval_ms
        {
            return invalid("heartbeat_timeout_ms must exceed a positive heartbeat_interval_ms");
        }
        if gateway.max_strikes == 0 || gateway.max_connections == 0 || gateway.outbound_queue == 0 {
            return invalid("max_strikes, max_connections and outbound_queue must be positive");
        }
        for rate in [&gateway.anonymous_rate, &gateway.player_rate, &gateway.admin_rate] {
            if rate.capacity == 0 || rate.refill_per_sec.is_nan() || rate.refill_per_sec <= 0.0 {
                return invalid("rate limits need a positive capacity and refill rate");
            }
        }

        if self.timer.broadcast_interval_ms == 0 {
            return invalid("broadcast_interval_ms must be positive");
        }
        if self.history_capacity == 0 {
            return invalid("history_capacity must be positive");
        }

        Ok(())
    }
}
