//! Connection state and the reconnect state machine

use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Observable state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Attempts before giving up for good
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0), applied as +/- a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Fast retries for tests and local setups
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
        }
    }

    /// Delay without jitter before attempt `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before attempt `attempt`, jittered
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt).as_secs_f64();
        let factor = self.jitter_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let jitter = capped * factor * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Where the reconnect loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Connected and serving requests
    Open,
    /// Waiting out the backoff before attempt `n`
    BackoffWait(u32),
    /// Running attempt `n`
    Connecting(u32),
    /// All attempts used up
    Exhausted(u32),
    /// Stopped by the caller or by a credential rejection
    Halted,
}

/// Inputs that move the reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectInput {
    ConnectionLost,
    BackoffElapsed,
    Connected,
    AttemptFailed,
    AuthRejected,
    Stop,
}

impl ReconnectPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted(_) | Self::Halted)
    }
}

/// Pure transition function of the reconnect loop.
///
/// Inputs that make no sense in the current phase leave it unchanged.
pub fn transition(
    phase: ReconnectPhase,
    input: ReconnectInput,
    max_attempts: u32,
) -> ReconnectPhase {
    use ReconnectInput as In;
    use ReconnectPhase as P;

    match (phase, input) {
        (P::Exhausted(n), _) => P::Exhausted(n),
        (P::Halted, _) => P::Halted,
        (_, In::Stop) => P::Halted,
        (P::Open, In::ConnectionLost) => {
            if max_attempts == 0 {
                P::Exhausted(0)
            } else {
                P::BackoffWait(1)
            }
        }
        (P::BackoffWait(n), In::BackoffElapsed) => P::Connecting(n),
        (P::Connecting(_), In::Connected) => P::Open,
        (P::Connecting(_), In::AuthRejected) => P::Halted,
        (P::Connecting(n), In::AttemptFailed) => {
            if n >= max_attempts {
                P::Exhausted(n)
            } else {
                P::BackoffWait(n + 1)
            }
        }
        (phase, _) => phase,
    }
}
