//! Dedup cache of synced zones
//!
//! Maps each synced uuid to the timestamp it was last synced at and to the
//! local id it belongs to. It is rebuilt from the persisted sync markers at
//! the start of every cycle and updated as the cycle writes.

use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::models::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    synced_at: i64,
    local_id: i64,
}

#[derive(Debug, Default)]
pub struct SyncCache {
    entries: HashMap<String, Entry>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the markers of `zones`
    ///
    /// When two zones share a uuid the lower local id keeps the entry.
    pub fn rebuild(&mut self, zones: &BTreeMap<i64, Zone>) {
        self.entries.clear();
        for zone in zones.values() {
            let (Some(uuid), Some(synced_at)) = (zone.uuid(), zone.last_synced_at) else {
                continue;
            };
            if let Some(existing) = self.entries.get(uuid) {
                warn!(
                    "Zones {} and {} share uuid {}; keeping {}",
                    existing.local_id, zone.id, uuid, existing.local_id
                );
                continue;
            }
            self.entries.insert(
                uuid.to_string(),
                Entry {
                    synced_at,
                    local_id: zone.id,
                },
            );
        }
    }

    pub fn synced_at(&self, uuid: &str) -> Option<i64> {
        self.entries.get(uuid).map(|e| e.synced_at)
    }

    pub fn local_id(&self, uuid: &str) -> Option<i64> {
        self.entries.get(uuid).map(|e| e.local_id)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.entries.contains_key(uuid)
    }

    pub fn record(&mut self, uuid: &str, local_id: i64, synced_at: i64) {
        self.entries
            .insert(uuid.to_string(), Entry { synced_at, local_id });
    }

    pub fn remove(&mut self, uuid: &str) -> bool {
        self.entries.remove(uuid).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: i64, uuid: &str, synced_at: Option<i64>) -> Zone {
        let mut zone = Zone::new(format!("zone-{id}"));
        zone.id = id;
        zone.uuid = Some(uuid.to_string());
        zone.last_synced_at = synced_at;
        zone
    }

    #[test]
    fn test_rebuild_only_takes_synced_zones() {
        let zones: BTreeMap<i64, Zone> = [
            (1, zone(1, "a", Some(100))),
            (2, zone(2, "b", None)),
            (3, zone(3, "a", Some(300))),
        ]
        .into_iter()
        .collect();

        let mut cache = SyncCache::new();
        cache.record("stale", 9, 1);
        cache.rebuild(&zones);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.synced_at("a"), Some(100));
        assert_eq!(cache.local_id("a"), Some(1));
        assert!(!cache.contains("b"));
        assert!(!cache.contains("stale"));
    }

    #[test]
    fn test_record_and_remove() {
        let mut cache = SyncCache::new();
        cache.record("a", 4, 50);
        cache.record("a", 4, 60);
        assert_eq!(cache.synced_at("a"), Some(60));
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(cache.is_empty());
    }
}
