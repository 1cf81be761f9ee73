//! Correlation table: request id → completion handle + deadline

use std::collections::HashMap;
use tokio::time::Instant;

/// One outstanding request
#[derive(Debug)]
pub struct Pending<H> {
    pub handle: H,
    pub deadline: Instant,
    pub issued_at: Instant,
}

/// Outstanding requests keyed by correlation id.
///
/// Owned by the dispatcher task; nothing else mutates it.
#[derive(Debug)]
pub struct PendingTable<H> {
    entries: HashMap<u64, Pending<H>>,
}

impl<H> PendingTable<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Track a new request. Returns false, leaving the table untouched, if
    /// the id is already outstanding.
    pub fn insert(&mut self, id: u64, handle: H, issued_at: Instant, deadline: Instant) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(
            id,
            Pending {
                handle,
                deadline,
                issued_at,
            },
        );
        true
    }

    /// Remove the entry matching a response; `None` for unknown or already
    /// expired ids.
    pub fn complete(&mut self, id: u64) -> Option<Pending<H>> {
        self.entries.remove(&id)
    }

    /// Remove and return every entry whose deadline is at or before `now`,
    /// ordered by id.
    pub fn expire(&mut self, now: Instant) -> Vec<(u64, Pending<H>)> {
        let mut expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Earliest deadline among outstanding entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove every entry, ordered by id
    pub fn drain(&mut self) -> Vec<(u64, Pending<H>)> {
        let mut all: Vec<(u64, Pending<H>)> = self.entries.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H> Default for PendingTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_duplicate_ids_rejected() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        assert!(table.insert(1, "a", now, now + Duration::from_secs(5)));
        assert!(!table.insert(1, "b", now, now + Duration::from_secs(5)));
        assert_eq!(table.complete(1).unwrap().handle, "a");
        assert!(table.complete(1).is_none());
    }

    #[test]
    fn test_expire_only_past_deadlines() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        table.insert(3, 'c', now, now + Duration::from_secs(1));
        table.insert(1, 'a', now, now + Duration::from_secs(10));
        table.insert(2, 'b', now, now + Duration::from_secs(1));

        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(1)));

        let expired = table.expire(now + Duration::from_secs(2));
        let ids: Vec<u64> = expired.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(1));
    }

    #[test]
    fn test_drain_empties_in_id_order() {
        let now = Instant::now();
        let mut table = PendingTable::new();
        for id in [5u64, 2, 9] {
            table.insert(id, (), now, now);
        }
        let ids: Vec<u64> = table.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(table.is_empty());
        assert_eq!(table.next_deadline(), None);
    }
}
