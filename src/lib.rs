//! Home Assistant MCP Core
//!
//! Resilient link between an MCP orchestrator and a Home Assistant instance.
//!
//! # Features
//!
//! - **WebSocket Link**: authenticated, multiplexed request/response by correlation id
//! - **Auto-Reconnect**: exponential backoff with jitter and subscription replay
//! - **Heartbeat**: ping/pong liveness checks
//! - **Entity Cache**: `state_changed`-fed cache with staleness tracking
//! - **Circuit Breaker**: stops hammering an unhealthy remote
//! - **Command Queue**: parks commands while the breaker is open
//! - **Rate Limiting**: per-caller and global fixed windows
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──► HassClient ──► RateLimiter ──► CircuitBreaker ──► ConnectionManager ──► Home Assistant
//!                      │                              │                  (actor task)         (WebSocket)
//!                      │                              └── CommandQueue ◄──┘ drained on reconnect
//!                      ├── EntityCache ◄── state_changed events + get_states snapshots
//!                      └── Supervisor (lifecycle events, maintenance tick)
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod resilience;
pub mod transport;

pub use cache::{CacheConfig, CacheStats, DomainPolicy, Entity, EntityCache, EntityFilter};
pub use client::{ClientStats, HassClient};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use connection::{
    BackoffConfig, ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats,
    EventFilter, LinkHook, Subscription, SubscriptionEvent, SubscriptionId, SubscriptionInfo,
};
pub use error::{CoreError, Result};
pub use events::LifecycleEvent;
pub use protocol::Request;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CommandQueue, QueueConfig,
    RateLimitConfig, RateLimiter,
};
pub use transport::{Connector, MemoryConnector, RemotePeer, Transport, WebSocketConnector};
