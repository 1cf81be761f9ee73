//! Failure isolation for outbound commands
//!
//! - `circuit_breaker`: short-circuits calls while the remote is unhealthy
//! - `queue`: bounded, TTL-bounded landing zone for refused commands
//! - `rate_limit`: per-caller and global fixed-window admission

pub mod circuit_breaker;
pub mod queue;
pub mod rate_limit;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats, Permit};
pub use queue::{CommandQueue, DrainReport, QueueConfig, QueueStats, Ticket};
pub use rate_limit::{RateLimitConfig, RateLimitStats, RateLimitStatus, RateLimiter};
