//! Home Assistant client
//!
//! Wires the connection, the entity cache and the resilience layers into the
//! surface an orchestrator talks to. Outbound commands pass the rate limiter,
//! then the circuit breaker, then the connection; commands refused by an open
//! breaker wait in the command queue until the next successful reconnect.
//!
//! The cache is hooked into the connection actor itself: it turns stale the
//! moment the link drops and stays stale until a refetch lands, so no query
//! is answered from pre-outage state once the link is back.
//!
//! A supervisor task follows the connection lifecycle:
//! - resumed `Connected`: forward the event, refetch `get_states`, drain the
//!   queue
//! - `PermanentlyDisconnected`: reject queued commands
//! - periodic tick: purge aged queue entries and ended rate windows

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{validate_entity_id, CacheUpdate, Entity, EntityCache, EntityFilter};
use crate::clock::{self, SharedClock};
use crate::config::Config;
use crate::connection::{
    ConnectionManager, ConnectionState, EventFilter, Subscription, SubscriptionEvent,
    SubscriptionId,
};
use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Observers};
use crate::protocol::Request;
use crate::resilience::{CircuitBreaker, CircuitState, CommandQueue, RateLimitStats, RateLimiter};
use crate::transport::{Connector, WebSocketConnector};

const STATE_CHANGED: &str = "state_changed";

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid service name pattern"));

/// Health snapshot for status endpoints and logs
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub connection_state: ConnectionState,
    pub cache_size: usize,
    pub cache_stale: bool,
    pub circuit_state: CircuitState,
    pub queue_depth: usize,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub reconnect_attempts: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub rate_limit: RateLimitStats,
}

struct Core {
    connection: ConnectionManager,
    cache: Arc<EntityCache>,
    breaker: CircuitBreaker,
    queue: CommandQueue,
    limiter: RateLimiter,
    lifecycle: Observers<LifecycleEvent>,
    blocked_service_domains: HashSet<String>,
    maintenance_interval: Duration,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    state_feed: Option<(SubscriptionId, JoinHandle<()>)>,
}

/// Resilient Home Assistant client
pub struct HassClient {
    core: Arc<Core>,
    tasks: Mutex<Tasks>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl HassClient {
    /// Client talking WebSocket to `config.url`
    pub fn new(config: Config) -> Result<Self> {
        let connector = WebSocketConnector::new(&config.url)?;
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    /// Client over an arbitrary transport
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self::with_clock(config, connector, clock::system())
    }

    /// Client whose cache and resilience layers read time from `clock`
    pub fn with_clock(config: Config, connector: Arc<dyn Connector>, clock: SharedClock) -> Self {
        let Config {
            access_token,
            connection,
            cache,
            circuit_breaker,
            queue,
            rate_limit,
            blocked_service_domains,
            maintenance_interval,
            ..
        } = config;

        let cache = Arc::new(EntityCache::with_clock(cache, clock.clone()));
        let connection = ConnectionManager::new(connection, connector, access_token.as_str())
            .with_link_hook(cache.clone());

        let core = Core {
            connection,
            cache,
            breaker: CircuitBreaker::with_clock("home-assistant", circuit_breaker, clock.clone()),
            queue: CommandQueue::with_clock(queue, clock.clone()),
            limiter: RateLimiter::with_clock(rate_limit, clock),
            lifecycle: Observers::new(),
            blocked_service_domains,
            maintenance_interval,
        };

        Self {
            core: Arc::new(core),
            tasks: Mutex::new(Tasks::default()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect, subscribe to `state_changed` and load the first snapshot.
    ///
    /// Safe to call again after a permanent disconnect; the state feed is
    /// re-established when its subscription is gone.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        self.start_supervisor();
        self.core.connection.connect().await?;
        self.ensure_state_feed().await?;

        let count = self.core.refresh_cache().await?;
        info!(
            "Home Assistant client ready ({} entities from {})",
            count,
            self.core.connection.endpoint()
        );
        Ok(())
    }

    fn start_supervisor(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.supervisor.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let lifecycle = self.core.connection.lifecycle();
        tasks.supervisor = Some(tokio::spawn(supervise(self.core.clone(), lifecycle)));
    }

    async fn ensure_state_feed(&self) -> Result<()> {
        let current = self.tasks.lock().state_feed.as_ref().map(|(id, _)| *id);
        if let Some(id) = current {
            let live = self.core.connection.subscriptions().await?;
            if live.iter().any(|info| info.id == id) {
                return Ok(());
            }
            debug!("state_changed subscription {} is gone, resubscribing", id);
        }

        let subscription = self
            .core
            .connection
            .subscribe(EventFilter::event_type(STATE_CHANGED))
            .await?;
        let id = subscription.id;
        let task = tokio::spawn(feed_cache(self.core.clone(), subscription.events));

        if let Some((_, previous)) = self.tasks.lock().state_feed.replace((id, task)) {
            previous.abort();
        }
        Ok(())
    }

    /// Send a raw command on behalf of `caller`
    pub async fn send_command(
        &self,
        caller: &str,
        command_type: &str,
        payload: Value,
    ) -> Result<Value> {
        let request = Request::from_value(command_type, payload)?;
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(request).await
    }

    /// Call a service. Domains that run code on the remote host are refused.
    pub async fn call_service(
        &self,
        caller: &str,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        target: Option<Value>,
    ) -> Result<Value> {
        validate_service_name(domain)?;
        validate_service_name(service)?;
        if self.core.blocked_service_domains.contains(domain) {
            warn!("Refusing {}.{} for {}: domain is blocked", domain, service, caller);
            return Err(CoreError::ServiceBlocked(domain.to_string()));
        }
        if let Some(target) = &target {
            validate_target(target)?;
        }

        let mut request = Request::new("call_service")
            .with("domain", domain)
            .with("service", service);
        if let Some(data) = service_data {
            request = request.with("service_data", data);
        }
        if let Some(target) = target {
            request = request.with("target", target);
        }

        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(request).await
    }

    pub async fn fire_event(
        &self,
        caller: &str,
        event_type: &str,
        event_data: Option<Value>,
    ) -> Result<Value> {
        if event_type.trim().is_empty() {
            return Err(CoreError::Protocol("event type must not be empty".to_string()));
        }
        self.core.limiter.check_and_consume(caller)?;
        self.core
            .execute(Request::fire_event(event_type, event_data))
            .await
    }

    pub async fn get_config(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::get_config()).await
    }

    pub async fn get_services(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::get_services()).await
    }

    pub async fn get_panels(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::get_panels()).await
    }

    /// Area registry entries
    pub async fn get_areas(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::area_registry()).await
    }

    /// Device registry entries
    pub async fn get_devices(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::device_registry()).await
    }

    pub async fn get_entity_registry(&self, caller: &str) -> Result<Value> {
        self.core.limiter.check_and_consume(caller)?;
        self.core.execute(Request::entity_registry()).await
    }

    /// Have the remote validate automation triggers, conditions and actions
    pub async fn validate_config(
        &self,
        caller: &str,
        trigger: Option<Value>,
        condition: Option<Value>,
        action: Option<Value>,
    ) -> Result<Value> {
        if trigger.is_none() && condition.is_none() && action.is_none() {
            return Err(CoreError::Protocol(
                "validate_config needs a trigger, condition or action".to_string(),
            ));
        }
        self.core.limiter.check_and_consume(caller)?;
        self.core
            .execute(Request::validate_config(trigger, condition, action))
            .await
    }

    /// Round trip a `ping`; returns the latency
    pub async fn ping(&self, caller: &str) -> Result<Duration> {
        self.core.limiter.check_and_consume(caller)?;
        let started = Instant::now();
        self.core.execute(Request::ping()).await?;
        Ok(started.elapsed())
    }

    /// Subscribe to one event type, or to every event with `None`
    pub async fn subscribe(&self, event_type: Option<&str>) -> Result<Subscription> {
        let filter = match event_type {
            Some(event_type) => EventFilter::event_type(event_type),
            None => EventFilter::All,
        };
        self.core.connection.subscribe(filter).await
    }

    /// Subscribe to an automation trigger
    pub async fn subscribe_trigger(&self, trigger: Value) -> Result<Subscription> {
        self.core.connection.subscribe(EventFilter::Trigger(trigger)).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.core.connection.unsubscribe(id).await
    }

    /// Another observer for an existing subscription
    pub async fn observe_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        self.core.connection.observe(id).await
    }

    /// Register a lifecycle observer
    pub fn lifecycle(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.core.lifecycle.register()
    }

    /// Query the cache, waiting for a pending refetch first
    pub async fn query_cache(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        self.core.fresh_cache().await?;
        Ok(self.core.cache.query(filter))
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        validate_entity_id(entity_id)?;
        self.core.fresh_cache().await?;
        Ok(self.core.cache.get(entity_id))
    }

    /// Reload the cache from `get_states`
    pub async fn refresh_cache(&self) -> Result<usize> {
        self.core.refresh_cache().await
    }

    pub fn cache(&self) -> &EntityCache {
        &self.core.cache
    }

    pub fn is_connected(&self) -> bool {
        self.core.connection.is_connected()
    }

    pub fn stats(&self) -> ClientStats {
        let connection = self.core.connection.stats();
        let cache = self.core.cache.stats();
        ClientStats {
            connection_state: connection.state,
            cache_size: cache.entities,
            cache_stale: cache.stale,
            circuit_state: self.core.breaker.state(),
            queue_depth: self.core.queue.len(),
            pending_requests: connection.pending_requests,
            subscriptions: connection.subscriptions,
            reconnect_attempts: connection.reconnect_attempts,
            last_activity: connection.last_activity,
            rate_limit: self.core.limiter.stats(),
        }
    }

    /// Stop background tasks, close the connection and reject queued commands
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if let Some(supervisor) = tasks.supervisor {
            supervisor.abort();
        }
        if let Some((_, feed)) = tasks.state_feed {
            feed.abort();
        }

        self.core.connection.disconnect().await;
        self.core.queue.clear();
        self.core.cache.mark_stale();
        self.core.lifecycle.emit(&LifecycleEvent::Disconnected {
            reason: "client shut down".to_string(),
        });
        info!("Home Assistant client shut down");
    }
}

impl Core {
    /// Breaker-guarded send; an open breaker parks the command in the queue
    /// while a reconnect is still coming
    async fn execute(&self, request: Request) -> Result<Value> {
        let attempt = request.clone();
        match self
            .breaker
            .execute(|| self.connection.send_request(attempt))
            .await
        {
            Err(CoreError::CircuitOpen { retry_after }) => {
                if let Some(unavailable) = self.connection.unavailable() {
                    debug!(
                        "Circuit open and no reconnect pending, failing {}",
                        request.command_type
                    );
                    return Err(unavailable);
                }
                debug!(
                    "Circuit open (retry after {:?}), queueing {}",
                    retry_after, request.command_type
                );
                self.queue.enqueue(request)?.await
            }
            outcome => outcome,
        }
    }

    async fn refresh_cache(&self) -> Result<usize> {
        let states = self.connection.send_request(Request::get_states()).await?;
        self.cache.load_snapshot(&states)
    }

    async fn fresh_cache(&self) -> Result<()> {
        if self.cache.is_stale() && !self.cache.wait_fresh(self.cache.refresh_wait()).await {
            return Err(CoreError::CacheStale);
        }
        Ok(())
    }

    async fn on_lifecycle(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Connected { resumed: true } => {
                self.lifecycle.emit(&event);
                self.resync().await;
                return;
            }
            LifecycleEvent::Disconnected { reason } => {
                debug!("Connection down ({}), cache is stale", reason);
            }
            LifecycleEvent::PermanentlyDisconnected { attempts } => {
                error!("Home Assistant unreachable after {} attempts", attempts);
                self.queue.clear();
            }
            LifecycleEvent::Error { message } => warn!("Connection error: {}", message),
            LifecycleEvent::Connected { resumed: false } => {}
        }
        self.lifecycle.emit(&event);
    }

    /// Refetch state, then replay commands parked while the breaker was open
    async fn resync(&self) {
        match self.refresh_cache().await {
            Ok(count) => debug!("Cache refetched after reconnect ({} entities)", count),
            Err(e) => warn!("Cache refetch after reconnect failed: {}", e),
        }

        if self.queue.is_empty() {
            return;
        }
        let connection = &self.connection;
        let report = self
            .queue
            .drain(move |request| connection.send_request(request))
            .await;
        debug!("Post-reconnect drain: {:?}", report);
    }

    async fn maintain(&self) {
        let expired = self.queue.purge_expired();
        let windows = self.limiter.cleanup();
        if expired > 0 || windows > 0 {
            debug!(
                "Maintenance: {} queued command(s) expired, {} rate window(s) dropped",
                expired, windows
            );
        }

        // Breaker recovered without a reconnect: the first drained command
        // is the half-open trial.
        if !self.queue.is_empty()
            && self.connection.is_connected()
            && self.breaker.state() != CircuitState::Open
        {
            let breaker = &self.breaker;
            let connection = &self.connection;
            self.queue
                .drain(move |request| breaker.execute(move || connection.send_request(request)))
                .await;
        }
    }
}

async fn supervise(core: Arc<Core>, mut lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>) {
    let period = core.maintenance_interval;
    let mut maintenance = tokio::time::interval_at(Instant::now() + period, period);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = lifecycle.recv() => match event {
                Some(event) => core.on_lifecycle(event).await,
                None => break,
            },
            _ = maintenance.tick() => core.maintain().await,
        }
    }
    debug!("Supervisor stopped");
}

async fn feed_cache(core: Arc<Core>, mut events: mpsc::UnboundedReceiver<SubscriptionEvent>) {
    while let Some(delivery) = events.recv().await {
        if let CacheUpdate::Ignored = core.cache.apply(&delivery.event) {
            debug!("state_changed event left the cache unchanged");
        }
    }
    debug!("state_changed feed closed");
}

fn validate_service_name(name: &str) -> Result<()> {
    if SERVICE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidServiceName(name.to_string()))
    }
}

/// Entity ids named by a service target must be well formed
fn validate_target(target: &Value) -> Result<()> {
    match target.get("entity_id") {
        Some(Value::String(id)) => validate_entity_id(id),
        Some(Value::Array(ids)) => ids.iter().try_for_each(|id| match id.as_str() {
            Some(id) => validate_entity_id(id),
            None => Err(CoreError::InvalidEntityId(id.to_string())),
        }),
        Some(other) => Err(CoreError::InvalidEntityId(other.to_string())),
        None => Ok(()),
    }
}
