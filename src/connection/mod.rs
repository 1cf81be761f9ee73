//! Home Assistant connection
//!
//! - `manager`: actor owning the transport, handshake, heartbeat and reconnects
//! - `pending`: correlation table for in-flight requests
//! - `registry`: subscriptions that survive reconnects
//! - `state`: connection states, backoff and the reconnect state machine

pub mod manager;
pub mod pending;
pub mod registry;
pub mod state;

pub use manager::{ConnectionConfig, ConnectionManager, ConnectionStats, LinkHook, Subscription};
pub use pending::PendingTable;
pub use registry::{EventFilter, SubscriptionEvent, SubscriptionId, SubscriptionInfo};
pub use state::{transition, BackoffConfig, ConnectionState, ReconnectInput, ReconnectPhase};
