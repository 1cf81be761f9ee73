//! Connection manager
//!
//! One actor task owns the transport, the pending table, the subscription
//! registry and the reconnect loop. Public methods send it commands over an
//! mpsc channel and wait on oneshot replies, so no connection state is ever
//! shared behind a lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::pending::PendingTable;
use super::registry::{
    EventFilter, SubscriptionEvent, SubscriptionId, SubscriptionInfo, SubscriptionRegistry,
};
use super::state::{transition, BackoffConfig, ConnectionState, ReconnectInput, ReconnectPhase};
use crate::error::{CoreError, Result};
use crate::events::{LifecycleEvent, Observers};
use crate::protocol::{encode_auth, FrameClass, Request, ServerFrame};
use crate::transport::{Connector, Transport};

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for `auth_required` → `auth_ok`
    pub auth_timeout: Duration,
    /// Deadline for every correlated request
    pub request_timeout: Duration,
    /// Ping period; zero disables the heartbeat
    pub heartbeat_interval: Duration,
    /// Time allowed for a heartbeat pong
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// Capacity of the command channel into the actor
    pub command_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            command_buffer: 256,
        }
    }
}

/// Established subscription with its first observer
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

/// Callbacks the actor runs inline, before the matching state change becomes
/// visible through `state()` or the lifecycle channel
pub trait LinkHook: Send + Sync {
    /// The authenticated link dropped
    fn link_lost(&self) {}

    /// A link was authenticated and is about to be published as `Open`
    fn link_restored(&self) {}
}

/// Point-in-time connection counters
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub reconnect_attempts: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Counters the actor publishes for readers outside it
struct Shared {
    state: Mutex<ConnectionState>,
    running: AtomicBool,
    pending: AtomicUsize,
    subscriptions: AtomicUsize,
    reconnect_attempts: AtomicU32,
    exhausted_after: Mutex<Option<u32>>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    next_id: AtomicU64,
    subscription_ids: Arc<AtomicU64>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            running: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            exhausted_after: Mutex::new(None),
            last_activity: Mutex::new(None),
            next_id: AtomicU64::new(1),
            subscription_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Connection state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Some(Utc::now());
    }
}

enum Command {
    Request {
        request: Request,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        filter: EventFilter,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Observe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<mpsc::UnboundedReceiver<SubscriptionEvent>>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Persistent, authenticated connection to Home Assistant
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    access_token: Arc<Zeroizing<String>>,
    connect_lock: tokio::sync::Mutex<()>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    lifecycle: Arc<Observers<LifecycleEvent>>,
    hook: Option<Arc<dyn LinkHook>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            config,
            connector,
            access_token: Arc::new(Zeroizing::new(access_token.into())),
            connect_lock: tokio::sync::Mutex::new(()),
            commands: Mutex::new(None),
            task: Mutex::new(None),
            shared: Arc::new(Shared::new()),
            lifecycle: Arc::new(Observers::new()),
            hook: None,
        }
    }

    /// Run `hook` inline on every link loss and every (re)established link
    pub fn with_link_hook(mut self, hook: Arc<dyn LinkHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Open the transport and authenticate.
    ///
    /// Concurrent calls are serialized; a call while the connection is open
    /// (or reconnecting on its own) returns immediately.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_running() {
            debug!("connect() ignored: connection already managed");
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        let transport = match establish(
            self.connector.as_ref(),
            &self.access_token,
            self.config.auth_timeout,
            &self.shared,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!("Connection to {} failed: {}", self.connector.endpoint(), e);
                return Err(e);
            }
        };

        *self.shared.exhausted_after.lock() = None;
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let actor = Actor {
            config: self.config.clone(),
            connector: self.connector.clone(),
            access_token: self.access_token.clone(),
            shared: self.shared.clone(),
            lifecycle: self.lifecycle.clone(),
            hook: self.hook.clone(),
            commands: rx,
            pending: PendingTable::new(),
            registry: SubscriptionRegistry::with_ids(self.shared.subscription_ids.clone()),
            heartbeat_id: None,
        };

        if let Some(hook) = &self.hook {
            hook.link_restored();
        }
        self.shared.set_state(ConnectionState::Open);
        self.shared.running.store(true, Ordering::SeqCst);
        *self.commands.lock() = Some(tx);
        let task = tokio::spawn(actor.run(transport));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }

        info!("Connected to {}", self.connector.endpoint());
        self.lifecycle.emit(&LifecycleEvent::Connected { resumed: false });
        Ok(())
    }

    /// Send one correlated request and wait for its result
    pub async fn send_request(&self, request: Request) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Request { request, reply }).await?;
        rx.await.map_err(|_| self.offline_error())?
    }

    /// Subscribe on the remote; the subscription is replayed after reconnects
    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Subscribe { filter, reply }).await?;
        rx.await.map_err(|_| self.offline_error())?
    }

    /// Attach another observer to an existing subscription
    pub async fn observe(
        &self,
        id: SubscriptionId,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Observe { id, reply }).await?;
        rx.await.map_err(|_| self.offline_error())?
    }

    /// Remove a subscription locally and on the remote
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Unsubscribe { id, reply }).await?;
        rx.await.map_err(|_| self.offline_error())?
    }

    /// Snapshot of the subscription registry
    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionInfo>> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Subscriptions { reply }).await?;
        rx.await.map_err(|_| self.offline_error())
    }

    /// Stop auto-reconnect, fail pending requests, close the transport and
    /// clear the registry
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;

        let sender = self.commands.lock().take();
        if let Some(sender) = sender {
            self.shared.set_state(ConnectionState::Closing);
            let (reply, rx) = oneshot::channel();
            if sender.send(Command::Disconnect { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Connection task ended abnormally: {}", e);
            }
        }

        *self.shared.exhausted_after.lock() = None;
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.pending.store(0, Ordering::SeqCst);
        self.shared.subscriptions.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Register a lifecycle observer
    pub fn lifecycle(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.lifecycle.register()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            pending_requests: self.shared.pending.load(Ordering::SeqCst),
            subscriptions: self.shared.subscriptions.load(Ordering::SeqCst),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::SeqCst),
            last_activity: *self.shared.last_activity.lock(),
        }
    }

    /// The error every command gets while no reconnect is coming: after the
    /// budget ran out, a halt or a disconnect. None while the link is open or
    /// being re-established.
    pub fn unavailable(&self) -> Option<CoreError> {
        if self.is_running() {
            None
        } else {
            Some(self.offline_error())
        }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
            && self
                .commands
                .lock()
                .as_ref()
                .map_or(false, |tx| !tx.is_closed())
    }

    fn offline_error(&self) -> CoreError {
        match *self.shared.exhausted_after.lock() {
            Some(attempts) => CoreError::PermanentlyDisconnected(attempts),
            None => CoreError::NotConnected,
        }
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        let sender = self.commands.lock().clone().ok_or_else(|| self.offline_error())?;
        sender.send(command).await.map_err(|_| self.offline_error())
    }
}

/// Open a transport and run the handshake on it
async fn establish(
    connector: &dyn Connector,
    access_token: &str,
    auth_timeout: Duration,
    shared: &Shared,
) -> Result<Box<dyn Transport>> {
    debug!("Opening transport to {}", connector.endpoint());
    let mut transport = connector.open().await?;
    shared.set_state(ConnectionState::Authenticating);

    match authenticate(transport.as_mut(), access_token, auth_timeout).await {
        Ok(version) => {
            shared.touch();
            info!(
                "Authenticated with Home Assistant {}",
                version.as_deref().unwrap_or("(unknown version)")
            );
            Ok(transport)
        }
        Err(e) => {
            transport.close().await;
            Err(e)
        }
    }
}

/// `auth_required` → `auth` → `auth_ok` | `auth_invalid`, bounded by `timeout`
async fn authenticate(
    transport: &mut dyn Transport,
    access_token: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    tokio::time::timeout(timeout, handshake(transport, access_token))
        .await
        .map_err(|_| CoreError::AuthTimeout(timeout))?
}

async fn handshake(transport: &mut dyn Transport, access_token: &str) -> Result<Option<String>> {
    loop {
        let text = transport.recv().await.ok_or(CoreError::ConnectionLost)??;
        match ServerFrame::parse(&text)? {
            ServerFrame::AuthRequired { .. } => {
                debug!("Remote requires authentication");
                transport.send(encode_auth(access_token)?).await?;
            }
            ServerFrame::AuthOk { ha_version } => return Ok(ha_version),
            ServerFrame::AuthInvalid { message } => {
                return Err(CoreError::AuthInvalid(
                    message.unwrap_or_else(|| "invalid access token".to_string()),
                ))
            }
            other => debug!("Ignoring pre-auth frame: {:?}", other.class()),
        }
    }
}

/// Completion handle stored in the pending table
enum Waiter {
    Request(oneshot::Sender<Result<Value>>),
    Subscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<Subscription>>,
        events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    },
    Unsubscribe(oneshot::Sender<Result<()>>),
    Heartbeat,
}

enum Exit {
    Lost(String),
    Stopped(Option<oneshot::Sender<()>>),
}

enum Offline {
    Elapsed,
    Stopped(Option<oneshot::Sender<()>>),
}

struct Actor {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    access_token: Arc<Zeroizing<String>>,
    shared: Arc<Shared>,
    lifecycle: Arc<Observers<LifecycleEvent>>,
    hook: Option<Arc<dyn LinkHook>>,
    commands: mpsc::Receiver<Command>,
    pending: PendingTable<Waiter>,
    registry: SubscriptionRegistry,
    heartbeat_id: Option<u64>,
}

impl Actor {
    async fn run(mut self, mut transport: Box<dyn Transport>) {
        let max_attempts = self.config.backoff.max_attempts;
        let mut phase = ReconnectPhase::Open;

        loop {
            phase = match phase {
                ReconnectPhase::Open => match self.serve(transport.as_mut()).await {
                    Exit::Stopped(reply) => {
                        self.shutdown(transport.as_mut()).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        return;
                    }
                    Exit::Lost(reason) => {
                        warn!("Connection lost: {}", reason);
                        transport.close().await;
                        self.connection_lost(&reason);
                        transition(phase, ReconnectInput::ConnectionLost, max_attempts)
                    }
                },
                ReconnectPhase::BackoffWait(attempt) => {
                    self.shared.reconnect_attempts.store(attempt, Ordering::SeqCst);
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    info!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        delay, attempt, max_attempts
                    );
                    match self.wait_offline(Instant::now() + delay).await {
                        Offline::Elapsed => {
                            transition(phase, ReconnectInput::BackoffElapsed, max_attempts)
                        }
                        Offline::Stopped(reply) => {
                            self.halt();
                            if let Some(reply) = reply {
                                let _ = reply.send(());
                            }
                            return;
                        }
                    }
                }
                ReconnectPhase::Connecting(attempt) => match self.reconnect(attempt).await {
                    Ok(fresh) => {
                        transport = fresh;
                        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
                        if let Some(hook) = &self.hook {
                            hook.link_restored();
                        }
                        self.shared.set_state(ConnectionState::Open);
                        info!("Reconnected after {} attempt(s)", attempt);
                        self.lifecycle.emit(&LifecycleEvent::Connected { resumed: true });
                        transition(phase, ReconnectInput::Connected, max_attempts)
                    }
                    Err(CoreError::AuthInvalid(message)) => {
                        error!("Credentials rejected during reconnect: {}", message);
                        self.halt();
                        self.lifecycle.emit(&LifecycleEvent::Error {
                            message: format!("authentication rejected: {}", message),
                        });
                        transition(phase, ReconnectInput::AuthRejected, max_attempts)
                    }
                    Err(e) => {
                        warn!("Reconnect attempt {} failed: {}", attempt, e);
                        self.shared.set_state(ConnectionState::Disconnected);
                        transition(phase, ReconnectInput::AttemptFailed, max_attempts)
                    }
                },
                ReconnectPhase::Exhausted(attempts) => {
                    error!("Giving up after {} reconnection attempts", attempts);
                    *self.shared.exhausted_after.lock() = Some(attempts);
                    self.halt();
                    self.lifecycle
                        .emit(&LifecycleEvent::PermanentlyDisconnected { attempts });
                    return;
                }
                ReconnectPhase::Halted => {
                    self.halt();
                    return;
                }
            };
        }
    }

    /// Serve commands, frames, deadlines and heartbeats until the connection
    /// ends
    async fn serve(&mut self, transport: &mut dyn Transport) -> Exit {
        let mut heartbeat = heartbeat_timer(self.config.heartbeat_interval);

        loop {
            self.publish_counts();
            let wake = self.pending.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    None => return Exit::Stopped(None),
                    Some(Command::Disconnect { reply }) => return Exit::Stopped(Some(reply)),
                    Some(command) => {
                        if let Err(e) = self.handle(command, transport).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                },
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("closed by remote".to_string()),
                },
                _ = sleep_until_deadline(wake) => {
                    if self.expire_due() {
                        return Exit::Lost("heartbeat timeout".to_string());
                    }
                },
                _ = next_tick(&mut heartbeat) => {
                    if let Err(e) = self.send_heartbeat(transport).await {
                        return Exit::Lost(e.to_string());
                    }
                },
            }
        }
    }

    /// Handle a caller command on an open connection. An error means the
    /// transport failed.
    async fn handle(&mut self, command: Command, transport: &mut dyn Transport) -> Result<()> {
        match command {
            Command::Request { request, reply } => {
                let id = self.next_id();
                self.issue(transport, id, &request, Waiter::Request(reply)).await
            }
            Command::Subscribe { filter, reply } => {
                let id = self.next_id();
                let (local, events) = self.registry.reserve(filter.clone(), id);
                let waiter = Waiter::Subscribe {
                    id: local,
                    reply,
                    events,
                };
                self.issue(transport, id, &filter.subscribe_request(), waiter).await
            }
            Command::Unsubscribe { id, reply } => match self.registry.remove(id) {
                None => {
                    let _ = reply.send(Err(CoreError::UnknownSubscription(id)));
                    Ok(())
                }
                Some(None) => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Some(Some(remote_id)) => {
                    debug!("Unsubscribing {} (remote {})", id, remote_id);
                    let request_id = self.next_id();
                    let request = Request::unsubscribe_events(remote_id);
                    self.issue(transport, request_id, &request, Waiter::Unsubscribe(reply))
                        .await
                }
            },
            other => {
                self.handle_local(other);
                Ok(())
            }
        }
    }

    /// Commands answered without the remote
    fn handle_local(&mut self, command: Command) {
        match command {
            Command::Observe { id, reply } => {
                let _ = reply.send(
                    self.registry
                        .observe(id)
                        .ok_or(CoreError::UnknownSubscription(id)),
                );
            }
            Command::Subscriptions { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Unsubscribe { id, reply } => {
                let outcome = match self.registry.remove(id) {
                    Some(_) => Ok(()),
                    None => Err(CoreError::UnknownSubscription(id)),
                };
                let _ = reply.send(outcome);
            }
            Command::Request { reply, .. } => {
                let _ = reply.send(Err(CoreError::NotConnected));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(CoreError::NotConnected));
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn issue(
        &mut self,
        transport: &mut dyn Transport,
        id: u64,
        request: &Request,
        waiter: Waiter,
    ) -> Result<()> {
        let frame = match request.encode(id) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(waiter, e);
                return Ok(());
            }
        };

        let now = Instant::now();
        if !self
            .pending
            .insert(id, waiter, now, now + self.config.request_timeout)
        {
            warn!("Correlation id {} already in flight", id);
            return Ok(());
        }
        debug!("→ {} #{}", request.command_type, id);
        transport.send(frame).await
    }

    fn dispatch(&mut self, text: &str) {
        self.shared.touch();
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding malformed frame: {}", e);
                return;
            }
        };

        match frame.class() {
            FrameClass::Response(id) => self.complete(id, frame.into_outcome()),
            FrameClass::Event(id) => {
                if let ServerFrame::Event { event, .. } = frame {
                    self.route_event(id, event);
                }
            }
            FrameClass::Handshake => debug!("Ignoring handshake frame on open connection"),
            FrameClass::Ignored => debug!("Ignoring unrecognised frame"),
        }
    }

    fn route_event(&mut self, remote_id: u64, event: Value) {
        match self.registry.route(remote_id, event) {
            Some((id, 0)) => debug!("Subscription {} has no observers", id),
            Some(_) => {}
            None => debug!("Discarding event for unknown subscription #{}", remote_id),
        }
    }

    fn complete(&mut self, id: u64, outcome: Result<Value>) {
        let Some(pending) = self.pending.complete(id) else {
            debug!("Discarding response for unknown or expired request #{}", id);
            return;
        };

        match pending.handle {
            Waiter::Request(reply) => {
                let _ = reply.send(outcome);
            }
            Waiter::Subscribe {
                id: local,
                reply,
                events,
            } => match outcome {
                Ok(_) => {
                    self.registry.activate(local);
                    info!("Subscription {} active (remote #{})", local, id);
                    if reply.send(Ok(Subscription { id: local, events })).is_err() {
                        debug!("Subscriber for {} went away before confirmation", local);
                    }
                }
                Err(e) => {
                    self.registry.remove(local);
                    let _ = reply.send(Err(e));
                }
            },
            Waiter::Unsubscribe(reply) => {
                let _ = reply.send(outcome.map(|_| ()));
            }
            Waiter::Heartbeat => {
                debug!("Heartbeat answered in {:?}", pending.issued_at.elapsed());
            }
        }
    }

    fn fail(&mut self, waiter: Waiter, error: CoreError) {
        match waiter {
            Waiter::Request(reply) => {
                let _ = reply.send(Err(error));
            }
            Waiter::Subscribe { id, reply, .. } => {
                self.registry.remove(id);
                let _ = reply.send(Err(error));
            }
            Waiter::Unsubscribe(reply) => {
                let _ = reply.send(Err(error));
            }
            Waiter::Heartbeat => {}
        }
    }

    /// Fail every request past its deadline. Returns true when the heartbeat
    /// was among them.
    fn expire_due(&mut self) -> bool {
        let mut heartbeat_missed = false;
        for (id, pending) in self.pending.expire(Instant::now()) {
            let after = pending.deadline.saturating_duration_since(pending.issued_at);
            match pending.handle {
                Waiter::Heartbeat => heartbeat_missed = true,
                waiter => {
                    warn!("Request #{} timed out after {:?}", id, after);
                    self.fail(waiter, CoreError::Timeout { id, after });
                }
            }
        }
        heartbeat_missed
    }

    async fn send_heartbeat(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if let Some(id) = self.heartbeat_id {
            if self.pending.contains(id) {
                return Ok(());
            }
        }

        let id = self.next_id();
        let now = Instant::now();
        self.pending
            .insert(id, Waiter::Heartbeat, now, now + self.config.heartbeat_timeout);
        self.heartbeat_id = Some(id);
        transport.send(Request::ping().encode(id)?).await
    }

    /// Post-auth failure: fail everything in flight in one pass
    fn connection_lost(&mut self, reason: &str) {
        if let Some(hook) = &self.hook {
            hook.link_lost();
        }
        self.shared.set_state(ConnectionState::Disconnected);

        let in_flight = self.pending.drain();
        if !in_flight.is_empty() {
            info!("Failing {} in-flight request(s)", in_flight.len());
        }
        for (_, pending) in in_flight {
            self.fail(pending.handle, CoreError::ConnectionLost);
        }

        let unconfirmed = self.registry.detach();
        if !unconfirmed.is_empty() {
            debug!("Dropped unconfirmed subscriptions {:?}", unconfirmed);
        }

        self.heartbeat_id = None;
        self.publish_counts();
        self.lifecycle.emit(&LifecycleEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Wait out a backoff, answering commands with `NotConnected` meanwhile
    async fn wait_offline(&mut self, until: Instant) -> Offline {
        let sleep = tokio::time::sleep_until(until);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Offline::Elapsed,
                command = self.commands.recv() => match command {
                    None => return Offline::Stopped(None),
                    Some(Command::Disconnect { reply }) => return Offline::Stopped(Some(reply)),
                    Some(command) => {
                        self.handle_local(command);
                        self.publish_counts();
                    }
                },
            }
        }
    }

    async fn reconnect(&mut self, attempt: u32) -> Result<Box<dyn Transport>> {
        self.shared.set_state(ConnectionState::Connecting);
        debug!("Reconnect attempt {}", attempt);

        let mut transport = establish(
            self.connector.as_ref(),
            &self.access_token,
            self.config.auth_timeout,
            &self.shared,
        )
        .await?;

        if let Err(e) = self.replay(transport.as_mut()).await {
            self.registry.detach();
            transport.close().await;
            return Err(e);
        }
        Ok(transport)
    }

    /// Re-issue every active subscription in registration order, once each.
    ///
    /// A remote rejection drops that subscription and emits `Error`; a
    /// transport failure aborts the attempt.
    async fn replay(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let plan = self.registry.replay_plan();
        if !plan.is_empty() {
            info!("Replaying {} subscription(s)", plan.len());
        }

        for (local, filter) in plan {
            let id = self.next_id();
            self.registry.rebind(local, id);
            transport.send(filter.subscribe_request().encode(id)?).await?;

            match self.await_response(transport, id).await? {
                Ok(_) => debug!("Subscription {} restored as remote #{}", local, id),
                Err(e) => {
                    warn!("Remote rejected replay of subscription {}: {}", local, e);
                    self.registry.remove(local);
                    self.lifecycle.emit(&LifecycleEvent::Error {
                        message: format!("subscription {} could not be restored: {}", local, e),
                    });
                }
            }
        }
        self.publish_counts();
        Ok(())
    }

    /// Read frames until the response for `id`, routing events meanwhile.
    /// The outer error is a connection failure, the inner one the remote's
    /// answer.
    async fn await_response(
        &mut self,
        transport: &mut dyn Transport,
        id: u64,
    ) -> Result<Result<Value>> {
        let after = self.config.request_timeout;
        let deadline = Instant::now() + after;

        loop {
            let frame = tokio::time::timeout_at(deadline, transport.recv())
                .await
                .map_err(|_| CoreError::Timeout { id, after })?;
            let text = frame.ok_or(CoreError::ConnectionLost)??;
            self.shared.touch();

            let frame = match ServerFrame::parse(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Discarding malformed frame: {}", e);
                    continue;
                }
            };
            match frame.class() {
                FrameClass::Response(rid) if rid == id => return Ok(frame.into_outcome()),
                FrameClass::Event(rid) => {
                    if let ServerFrame::Event { event, .. } = frame {
                        self.route_event(rid, event);
                    }
                }
                other => debug!("Discarding frame during replay: {:?}", other),
            }
        }
    }

    /// Orderly close requested by the caller or by dropping the manager
    async fn shutdown(&mut self, transport: &mut dyn Transport) {
        if let Some(hook) = &self.hook {
            hook.link_lost();
        }
        self.shared.set_state(ConnectionState::Closing);
        for (_, pending) in self.pending.drain() {
            self.fail(pending.handle, CoreError::ConnectionLost);
        }
        transport.close().await;
        self.registry.clear();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        self.publish_counts();
        info!("Connection closed");
        self.lifecycle.emit(&LifecycleEvent::Disconnected {
            reason: "closed by client".to_string(),
        });
    }

    /// Terminal state without a transport
    fn halt(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.registry.clear();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
        self.publish_counts();
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn publish_counts(&self) {
        self.shared.pending.store(self.pending.len(), Ordering::SeqCst);
        self.shared
            .subscriptions
            .store(self.registry.len(), Ordering::SeqCst);
    }
}

fn heartbeat_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
