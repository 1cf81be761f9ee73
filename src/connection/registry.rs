//! Subscription registry
//!
//! Local subscription ids are stable for the lifetime of the manager and
//! increase with registration order. The remote id (the id of the
//! `subscribe_*` request that created the subscription on the current
//! connection) changes on every replay.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::events::Observers;
use crate::protocol::Request;

/// Stable local subscription id
pub type SubscriptionId = u64;

/// What a subscription listens for
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventFilter {
    /// Every event on the bus
    All,
    /// One event type, e.g. `state_changed`
    EventType(String),
    /// Automation-style trigger definition
    Trigger(Value),
}

impl EventFilter {
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self::EventType(event_type.into())
    }

    /// Request that establishes this subscription on the remote
    pub fn subscribe_request(&self) -> Request {
        match self {
            Self::All => Request::subscribe_events(None),
            Self::EventType(event_type) => Request::subscribe_events(Some(event_type)),
            Self::Trigger(trigger) => Request::subscribe_trigger(trigger.clone()),
        }
    }
}

/// Event delivered to subscription observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionEvent {
    pub subscription: SubscriptionId,
    pub event: Value,
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub filter: EventFilter,
    pub active: bool,
    pub observers: usize,
}

struct Entry {
    filter: EventFilter,
    active: bool,
    remote_id: Option<u64>,
    observers: Observers<SubscriptionEvent>,
}

/// Registered subscriptions in registration order
pub struct SubscriptionRegistry {
    ids: Arc<AtomicU64>,
    entries: BTreeMap<SubscriptionId, Entry>,
    by_remote: HashMap<u64, SubscriptionId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_ids(Arc::new(AtomicU64::new(1)))
    }

    /// Registry drawing local ids from a counter that outlives it
    pub fn with_ids(ids: Arc<AtomicU64>) -> Self {
        Self {
            ids,
            entries: BTreeMap::new(),
            by_remote: HashMap::new(),
        }
    }

    /// Add an unconfirmed entry bound to `remote_id`, with its first observer
    pub fn reserve(
        &mut self,
        filter: EventFilter,
        remote_id: u64,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let id = self.ids.fetch_add(1, Ordering::SeqCst);

        let observers = Observers::new();
        let rx = observers.register();
        self.entries.insert(
            id,
            Entry {
                filter,
                active: false,
                remote_id: Some(remote_id),
                observers,
            },
        );
        self.by_remote.insert(remote_id, id);
        (id, rx)
    }

    /// Mark a reserved entry as confirmed by the remote
    pub fn activate(&mut self, id: SubscriptionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.active = true;
                true
            }
            None => false,
        }
    }

    /// Drop an entry; returns its remote id if it had one on this connection
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Option<u64>> {
        let entry = self.entries.remove(&id)?;
        if let Some(remote_id) = entry.remote_id {
            self.by_remote.remove(&remote_id);
        }
        Some(entry.remote_id)
    }

    /// Add an observer to an existing entry
    pub fn observe(
        &self,
        id: SubscriptionId,
    ) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        self.entries.get(&id).map(|entry| entry.observers.register())
    }

    /// Fan an event out to the subscription bound to `remote_id`.
    /// Returns the local id and the number of observers reached.
    pub fn route(&self, remote_id: u64, event: Value) -> Option<(SubscriptionId, usize)> {
        let id = *self.by_remote.get(&remote_id)?;
        let entry = self.entries.get(&id)?;
        let delivered = entry.observers.emit(&SubscriptionEvent {
            subscription: id,
            event,
        });
        Some((id, delivered))
    }

    /// Forget every remote binding after the connection dropped.
    ///
    /// Unconfirmed entries cannot be replayed and are removed; their ids are
    /// returned.
    pub fn detach(&mut self) -> Vec<SubscriptionId> {
        self.by_remote.clear();
        let unconfirmed: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.active)
            .map(|(id, _)| *id)
            .collect();
        for id in &unconfirmed {
            self.entries.remove(id);
        }
        for entry in self.entries.values_mut() {
            entry.remote_id = None;
        }
        unconfirmed
    }

    /// Active entries in registration order
    pub fn replay_plan(&self) -> Vec<(SubscriptionId, EventFilter)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, entry)| (*id, entry.filter.clone()))
            .collect()
    }

    /// Bind an entry to the remote id of its replayed subscribe request
    pub fn rebind(&mut self, id: SubscriptionId, remote_id: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if let Some(old) = entry.remote_id.replace(remote_id) {
                    self.by_remote.remove(&old);
                }
                self.by_remote.insert(remote_id, id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_remote.clear();
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: *id,
                filter: entry.filter.clone(),
                active: entry.active,
                observers: entry.observers.len(),
            })
            .collect()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_route_by_remote_id() {
        let mut registry = SubscriptionRegistry::new();
        let (id, mut rx) = registry.reserve(EventFilter::event_type("state_changed"), 7);
        registry.activate(id);

        assert_eq!(registry.route(7, json!({"a": 1})), Some((id, 1)));
        assert_eq!(registry.route(8, json!({})), None);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subscription, id);
        assert_eq!(event.event, json!({"a": 1}));
    }

    #[test]
    fn test_detach_drops_unconfirmed_and_keeps_order() {
        let mut registry = SubscriptionRegistry::new();
        let (first, _a) = registry.reserve(EventFilter::All, 1);
        let (pending, _b) = registry.reserve(EventFilter::event_type("call_service"), 2);
        let (third, _c) = registry.reserve(EventFilter::event_type("state_changed"), 3);
        registry.activate(first);
        registry.activate(third);

        assert_eq!(registry.detach(), vec![pending]);
        assert!(registry.route(1, json!({})).is_none());

        let plan: Vec<SubscriptionId> = registry
            .replay_plan()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(plan, vec![first, third]);

        assert!(registry.rebind(third, 20));
        assert_eq!(registry.route(20, json!({})).map(|(id, _)| id), Some(third));
    }

    #[test]
    fn test_remove_returns_remote_binding() {
        let mut registry = SubscriptionRegistry::new();
        let (id, _rx) = registry.reserve(EventFilter::All, 4);
        assert_eq!(registry.remove(id), Some(Some(4)));
        assert_eq!(registry.remove(id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shared_counter_keeps_ids_unique_across_registries() {
        let ids = Arc::new(AtomicU64::new(1));
        let mut first = SubscriptionRegistry::with_ids(ids.clone());
        let (old, _a) = first.reserve(EventFilter::All, 1);
        first.clear();

        let mut second = SubscriptionRegistry::with_ids(ids);
        let (new, _b) = second.reserve(EventFilter::All, 1);
        assert!(new > old);
        assert_eq!(second.remove(old), None);
    }

    #[test]
    fn test_filter_requests() {
        let request = EventFilter::event_type("state_changed").subscribe_request();
        assert_eq!(request.command_type, "subscribe_events");
        assert_eq!(request.payload["event_type"], "state_changed");

        let request = EventFilter::All.subscribe_request();
        assert!(request.payload.get("event_type").is_none());

        let request = EventFilter::Trigger(json!({"platform": "state"})).subscribe_request();
        assert_eq!(request.command_type, "subscribe_trigger");
    }
}
