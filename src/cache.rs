//! Entity Cache
//!
//! Local view of Home Assistant entity state, fed by `state_changed` events
//! and full `get_states` snapshots. Queries are answered from memory in
//! entity-id order.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::connection::LinkHook;
use crate::error::{CoreError, Result};

static ENTITY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("valid entity id pattern")
});

/// Whether `entity_id` is a well-formed `domain.object_id`
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    ENTITY_ID.is_match(entity_id)
}

pub fn validate_entity_id(entity_id: &str) -> Result<()> {
    if is_valid_entity_id(entity_id) {
        Ok(())
    } else {
        Err(CoreError::InvalidEntityId(entity_id.to_string()))
    }
}

/// One remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub last_changed: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    /// Part of the id before the first '.'
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map_or(self.entity_id.as_str(), |(domain, _)| domain)
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(Value::as_str)
    }
}

/// Which entities may enter the cache
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    /// Domains to keep; empty keeps every domain
    pub allowed_domains: HashSet<String>,
    /// Domains never cached
    pub blocked_domains: HashSet<String>,
    /// Individual entities never cached
    pub blocked_entities: HashSet<String>,
}

impl DomainPolicy {
    pub fn admits(&self, entity_id: &str) -> bool {
        if self.blocked_entities.contains(entity_id) {
            return false;
        }
        let domain = entity_id.split('.').next().unwrap_or_default();
        if self.blocked_domains.contains(domain) {
            return false;
        }
        self.allowed_domains.is_empty() || self.allowed_domains.contains(domain)
    }
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Outage length after which cached state is discarded on resume
    pub staleness_bound: Duration,
    /// How long readers wait for a pending refetch
    pub refresh_wait: Duration,
    pub policy: DomainPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_bound: Duration::from_secs(30),
            refresh_wait: Duration::from_secs(10),
            policy: DomainPolicy::default(),
        }
    }
}

/// Query over cached entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    /// Keep only `domain.*`
    pub domain: Option<String>,
    /// Exact state match
    pub state: Option<String>,
    /// Case-insensitive entity id substring
    pub search: Option<String>,
    /// Strip attributes when false
    pub include_attributes: bool,
    pub limit: Option<usize>,
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self {
            domain: None,
            state: None,
            search: None,
            include_attributes: true,
            limit: None,
        }
    }
}

impl EntityFilter {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn without_attributes(mut self) -> Self {
        self.include_attributes = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entity: &Entity, needle: Option<&str>) -> bool {
        if let Some(domain) = &self.domain {
            if entity.domain() != domain {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if &entity.state != state {
                return false;
            }
        }
        match needle {
            Some(needle) => entity.entity_id.to_lowercase().contains(needle),
            None => true,
        }
    }
}

/// What `apply` did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    Upserted(String),
    Removed(String),
    Ignored,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entities: usize,
    pub stale: bool,
    pub applied: u64,
    pub ignored: u64,
    pub snapshots: u64,
}

/// Entity state cache
pub struct EntityCache {
    entities: RwLock<BTreeMap<String, Entity>>,
    stale: watch::Sender<bool>,
    config: CacheConfig,
    clock: SharedClock,
    disconnected_at: Mutex<Option<Instant>>,
    applied: AtomicU64,
    ignored: AtomicU64,
    snapshots: AtomicU64,
}

impl EntityCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    /// A new cache is stale until its first snapshot lands
    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        let (stale, _) = watch::channel(true);
        Self {
            entities: RwLock::new(BTreeMap::new()),
            stale,
            config,
            clock,
            disconnected_at: Mutex::new(None),
            applied: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
        }
    }

    /// Apply one `state_changed` event.
    ///
    /// A null or missing `new_state` removes the entity. Events older than
    /// the cached `last_updated` are ignored.
    pub fn apply(&self, event: &Value) -> CacheUpdate {
        let update = self.apply_inner(event);
        match update {
            CacheUpdate::Ignored => self.ignored.fetch_add(1, Ordering::Relaxed),
            _ => self.applied.fetch_add(1, Ordering::Relaxed),
        };
        update
    }

    fn apply_inner(&self, event: &Value) -> CacheUpdate {
        if event.get("event_type").and_then(Value::as_str) != Some("state_changed") {
            return CacheUpdate::Ignored;
        }
        let data = match event.get("data") {
            Some(data) => data,
            None => return CacheUpdate::Ignored,
        };
        let entity_id = match data.get("entity_id").and_then(Value::as_str) {
            Some(id) => id,
            None => {
                debug!("state_changed without entity_id");
                return CacheUpdate::Ignored;
            }
        };
        if !is_valid_entity_id(entity_id) {
            debug!("Ignoring malformed entity id '{}'", entity_id);
            return CacheUpdate::Ignored;
        }
        if !self.config.policy.admits(entity_id) {
            return CacheUpdate::Ignored;
        }

        let new_state = match data.get("new_state") {
            None | Some(Value::Null) => {
                return match self.entities.write().remove(entity_id) {
                    Some(_) => {
                        debug!("Cache DEL: {}", entity_id);
                        CacheUpdate::Removed(entity_id.to_string())
                    }
                    None => CacheUpdate::Ignored,
                };
            }
            Some(state) => state,
        };

        let mut entity: Entity = match serde_json::from_value(new_state.clone()) {
            Ok(entity) => entity,
            Err(e) => {
                warn!("Unreadable new_state for {}: {}", entity_id, e);
                return CacheUpdate::Ignored;
            }
        };
        entity.entity_id = entity_id.to_string();

        let mut entities = self.entities.write();
        if let Some(current) = entities.get(entity_id) {
            if entity.last_updated < current.last_updated {
                debug!("Ignoring out-of-order update for {}", entity_id);
                return CacheUpdate::Ignored;
            }
        }
        entities.insert(entity_id.to_string(), entity);
        CacheUpdate::Upserted(entity_id.to_string())
    }

    /// Entities matching `filter`, ordered by id
    pub fn query(&self, filter: &EntityFilter) -> Vec<Entity> {
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let limit = filter.limit.unwrap_or(usize::MAX);

        self.entities
            .read()
            .values()
            .filter(|entity| filter.matches(entity, needle.as_deref()))
            .take(limit)
            .map(|entity| {
                let mut entity = entity.clone();
                if !filter.include_attributes {
                    entity.attributes.clear();
                }
                entity
            })
            .collect()
    }

    pub fn get(&self, entity_id: &str) -> Option<Entity> {
        self.entities.read().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Drop everything and mark the cache stale until the next snapshot
    pub fn invalidate(&self) {
        let dropped = {
            let mut entities = self.entities.write();
            let dropped = entities.len();
            entities.clear();
            dropped
        };
        self.stale.send_replace(true);
        info!("Entity cache invalidated ({} entities dropped)", dropped);
    }

    /// Install a full snapshot and clear the stale flag.
    ///
    /// Cached entities newer than their snapshot version are kept; entities
    /// missing from the snapshot are dropped.
    pub fn replace_all(&self, snapshot: Vec<Entity>) -> usize {
        let count = {
            let mut entities = self.entities.write();
            let mut fresh = BTreeMap::new();
            for entity in snapshot {
                if !is_valid_entity_id(&entity.entity_id)
                    || !self.config.policy.admits(&entity.entity_id)
                {
                    continue;
                }
                let keep = match entities.remove(&entity.entity_id) {
                    Some(current) if current.last_updated > entity.last_updated => current,
                    _ => entity,
                };
                fresh.insert(keep.entity_id.clone(), keep);
            }
            *entities = fresh;
            entities.len()
        };
        self.snapshots.fetch_add(1, Ordering::Relaxed);
        self.stale.send_replace(false);
        info!("Entity cache loaded {} entities", count);
        count
    }

    /// Install a raw `get_states` result, skipping unreadable entries
    pub fn load_snapshot(&self, states: &Value) -> Result<usize> {
        let items = states
            .as_array()
            .ok_or_else(|| CoreError::Protocol("get_states did not return a list".to_string()))?;

        let snapshot = items
            .iter()
            .filter_map(|item| match serde_json::from_value::<Entity>(item.clone()) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    debug!("Skipping unreadable state in snapshot: {}", e);
                    None
                }
            })
            .collect();
        Ok(self.replace_all(snapshot))
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.borrow()
    }

    /// Wait until the cache is fresh; false if `timeout` passes first
    pub async fn wait_fresh(&self, timeout: Duration) -> bool {
        let mut rx = self.stale.subscribe();
        let fresh = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|stale| !*stale)).await,
            Ok(Ok(_))
        );
        fresh
    }

    /// Record the start of an outage; repeated calls keep the first instant
    pub fn mark_disconnected(&self) {
        let mut since = self.disconnected_at.lock();
        if since.is_none() {
            *since = Some(self.clock.now());
        }
    }

    /// Length of the current outage, if any
    pub fn outage(&self) -> Option<Duration> {
        self.disconnected_at
            .lock()
            .map(|since| self.clock.now().saturating_duration_since(since))
    }

    /// Close the outage window and mark the cache stale until the next
    /// snapshot. Entities are kept unless the outage outlasted the staleness
    /// bound, in which case they are dropped and true is returned.
    pub fn resume(&self) -> bool {
        let outage = self
            .disconnected_at
            .lock()
            .take()
            .map(|since| self.clock.now().saturating_duration_since(since));

        match outage {
            Some(outage) if outage > self.config.staleness_bound => {
                info!("Outage of {:?} exceeded {:?}", outage, self.config.staleness_bound);
                self.invalidate();
                true
            }
            _ => {
                self.mark_stale();
                false
            }
        }
    }

    /// Keep entities but make readers wait for the next snapshot
    pub fn mark_stale(&self) {
        self.stale.send_replace(true);
    }

    pub fn refresh_wait(&self) -> Duration {
        self.config.refresh_wait
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entities: self.len(),
            stale: self.is_stale(),
            applied: self.applied.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
        }
    }
}

/// Stale from the moment the link drops until the next snapshot lands
impl LinkHook for EntityCache {
    fn link_lost(&self) {
        self.mark_disconnected();
        self.mark_stale();
    }

    fn link_restored(&self) {
        if self.resume() {
            info!("Entity cache dropped after a long outage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn state_changed(entity_id: &str, new_state: Value) -> Value {
        json!({
            "event_type": "state_changed",
            "data": {"entity_id": entity_id, "old_state": null, "new_state": new_state}
        })
    }

    fn state(entity_id: &str, value: &str, updated: &str) -> Value {
        json!({
            "entity_id": entity_id,
            "state": value,
            "attributes": {"friendly_name": entity_id},
            "last_changed": updated,
            "last_updated": updated,
        })
    }

    #[test]
    fn test_entity_id_validation() {
        assert!(is_valid_entity_id("light.kitchen"));
        assert!(is_valid_entity_id("sensor.outdoor_temp_2"));
        assert!(!is_valid_entity_id("Light.Kitchen"));
        assert!(!is_valid_entity_id("light"));
        assert!(!is_valid_entity_id("light.kitchen.extra"));
        assert!(validate_entity_id("light kitchen").is_err());
    }

    #[test]
    fn test_apply_upsert_and_remove() {
        let cache = EntityCache::new(CacheConfig::default());
        let update = cache.apply(&state_changed(
            "light.kitchen",
            state("light.kitchen", "on", "2024-05-01T10:00:00+00:00"),
        ));
        assert_eq!(update, CacheUpdate::Upserted("light.kitchen".to_string()));
        assert_eq!(cache.get("light.kitchen").unwrap().state, "on");

        let update = cache.apply(&state_changed("light.kitchen", Value::Null));
        assert_eq!(update, CacheUpdate::Removed("light.kitchen".to_string()));
        assert!(cache.get("light.kitchen").is_none());

        let removal = json!({
            "event_type": "state_changed",
            "data": {"entity_id": "light.kitchen"},
        });
        assert_eq!(cache.apply(&removal), CacheUpdate::Ignored);
    }

    #[test]
    fn test_out_of_order_update_ignored() {
        let cache = EntityCache::new(CacheConfig::default());
        cache.apply(&state_changed(
            "switch.fan",
            state("switch.fan", "on", "2024-05-01T10:00:05+00:00"),
        ));
        let update = cache.apply(&state_changed(
            "switch.fan",
            state("switch.fan", "off", "2024-05-01T10:00:00+00:00"),
        ));
        assert_eq!(update, CacheUpdate::Ignored);
        assert_eq!(cache.get("switch.fan").unwrap().state, "on");
        assert_eq!(cache.stats().ignored, 1);
    }

    #[test]
    fn test_policy_and_malformed_ids_never_cached() {
        let mut policy = DomainPolicy::default();
        policy.blocked_domains.insert("camera".to_string());
        policy.blocked_entities.insert("light.secret".to_string());
        let cache = EntityCache::new(CacheConfig {
            policy,
            ..Default::default()
        });

        for id in ["camera.door", "light.secret", "BAD.id"] {
            let event = state_changed(id, state(id, "on", "2024-05-01T10:00:00+00:00"));
            let update = cache.apply(&event);
            assert_eq!(update, CacheUpdate::Ignored);
        }
        assert!(cache.is_empty());

        let mut allow = DomainPolicy::default();
        allow.allowed_domains.insert("light".to_string());
        assert!(allow.admits("light.kitchen"));
        assert!(!allow.admits("switch.kitchen"));
    }

    #[test]
    fn test_query_filters_in_id_order() {
        let cache = EntityCache::new(CacheConfig::default());
        let snapshot = json!([
            state("switch.porch", "off", "2024-05-01T10:00:00+00:00"),
            state("light.living_room", "off", "2024-05-01T10:00:00+00:00"),
            state("light.kitchen", "on", "2024-05-01T10:00:00+00:00"),
            {"entity_id": "light.broken"},
        ]);
        assert_eq!(cache.load_snapshot(&snapshot).unwrap(), 3);

        let lights: Vec<String> = cache
            .query(&EntityFilter::domain("light"))
            .into_iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(lights, vec!["light.kitchen", "light.living_room"]);

        let on = cache.query(&EntityFilter::default().with_state("on"));
        assert_eq!(on.len(), 1);
        assert_eq!(on[0].entity_id, "light.kitchen");

        let found = cache.query(&EntityFilter::default().with_search("PORCH").without_attributes());
        assert_eq!(found.len(), 1);
        assert!(found[0].attributes.is_empty());

        assert_eq!(cache.query(&EntityFilter::default().with_limit(2)).len(), 2);
    }

    #[test]
    fn test_snapshot_keeps_newer_cached_entities() {
        let cache = EntityCache::new(CacheConfig::default());
        cache.apply(&state_changed(
            "light.kitchen",
            state("light.kitchen", "on", "2024-05-01T10:00:10+00:00"),
        ));
        cache.apply(&state_changed(
            "light.gone",
            state("light.gone", "on", "2024-05-01T10:00:10+00:00"),
        ));

        cache
            .load_snapshot(&json!([state("light.kitchen", "off", "2024-05-01T10:00:00+00:00")]))
            .unwrap();
        assert_eq!(cache.get("light.kitchen").unwrap().state, "on");
        assert!(cache.get("light.gone").is_none());
        assert!(!cache.is_stale());
    }

    #[test]
    fn test_resume_invalidates_only_after_long_outage() {
        let clock = ManualClock::new();
        let cache = EntityCache::with_clock(
            CacheConfig {
                staleness_bound: Duration::from_secs(30),
                ..Default::default()
            },
            Arc::new(clock.clone()),
        );
        cache.replace_all(Vec::new());

        cache.apply(&state_changed(
            "light.kitchen",
            state("light.kitchen", "on", "2024-05-01T10:00:00+00:00"),
        ));

        cache.mark_disconnected();
        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.outage(), Some(Duration::from_secs(10)));
        assert!(!cache.resume());
        assert!(cache.is_stale());
        assert_eq!(cache.len(), 1);

        cache.replace_all(cache.query(&EntityFilter::default()));
        cache.mark_disconnected();
        clock.advance(Duration::from_secs(31));
        cache.mark_disconnected();
        assert!(cache.resume());
        assert!(cache.is_stale());
        assert!(cache.is_empty());
        assert_eq!(cache.outage(), None);
    }

    #[test]
    fn test_link_loss_marks_stale_immediately() {
        let clock = ManualClock::new();
        let cache = EntityCache::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        let snapshot = json!([state("switch.pump", "on", "2024-05-01T10:00:00+00:00")]);
        assert_eq!(cache.load_snapshot(&snapshot).unwrap(), 1);
        assert!(!cache.is_stale());

        cache.link_lost();
        assert!(cache.is_stale());
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_secs(5));
        cache.link_restored();
        assert!(cache.is_stale());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.outage(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_fresh() {
        let cache = Arc::new(EntityCache::new(CacheConfig::default()));
        assert!(cache.is_stale());
        assert!(!cache.wait_fresh(Duration::from_secs(1)).await);

        let loader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cache.replace_all(Vec::new());
            })
        };
        assert!(cache.wait_fresh(Duration::from_secs(1)).await);
        loader.await.unwrap();
    }
}
