//! Storage layer
//!
//! Two interchangeable backends implement [`ZoneStorage`]:
//!
//! - **Relational** ([`RelationalStore`]): SQLite, one parent row per zone
//!   plus child rows for extents, inputs, outputs and specializations.
//! - **Document** ([`DocumentStore`]): a single JSON file, used when the
//!   database cannot be opened and as a best-effort backup mirror.
//!
//! [`StorageSelector`] probes the relational backend on first use and falls
//! back to the document backend for the rest of the process.
//!
//! Both backends share the write planning below, so timestamp handling is
//! identical: `last_updated` never decreases, and it is re-stamped only
//! when a field actually changed.

pub mod connection;
pub mod document;
pub mod error;
pub mod migrations;
pub mod relational;
pub mod selector;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::SyncClock;
use crate::models::Zone;

pub use connection::{ConnectionManager, ConnectionOptions};
pub use document::DocumentStore;
pub use error::{StorageError, StorageResult};
pub use migrations::{MigrationContext, MigrationError, LATEST_VERSION};
pub use relational::{RelationalStore, RetryPolicy};
pub use selector::StorageSelector;

/// Contract shared by every zone storage backend
pub trait ZoneStorage: Send + Sync {
    /// Every non-deleted zone keyed by local id
    fn load_all(&self) -> StorageResult<BTreeMap<i64, Zone>>;

    /// Insert, update or restore a zone
    ///
    /// Assigns `id` (max + 1) and `uuid` when missing and re-stamps
    /// `last_updated` only if a field differs from the persisted copy.
    /// The zone is updated in place with what was written.
    fn save(&self, zone: &mut Zone) -> StorageResult<()>;

    /// Persist a zone whose `last_updated` came from the sync server
    ///
    /// The timestamp is kept as given (never lowered below the persisted
    /// value) and the last-sync marker is set to it.
    fn record_sync(&self, zone: &mut Zone) -> StorageResult<()>;

    /// Tombstone a zone; returns the tombstone, or None if no live zone had this id
    fn delete(&self, id: i64) -> StorageResult<Option<Zone>>;

    /// A non-deleted zone by local id
    fn get_by_id(&self, id: i64) -> StorageResult<Option<Zone>>;

    fn is_available(&self) -> bool;

    /// Short backend name for logs
    fn kind(&self) -> &'static str;
}

/// Values every backend needs when planning a write
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub clock: Arc<SyncClock>,
    pub default_sync_group: Option<String>,
}

impl StoreContext {
    pub fn new(clock: Arc<SyncClock>, default_sync_group: Option<String>) -> Self {
        Self {
            clock,
            default_sync_group: default_sync_group.filter(|g| !g.trim().is_empty()),
        }
    }
}

/// What a planned write has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Update,
    Restore,
    Unchanged,
}

/// Sync status column value for a zone about to be written
pub(crate) fn sync_status(zone: &Zone) -> &'static str {
    match zone.last_synced_at {
        Some(at) if at >= zone.last_updated => "synced",
        Some(_) => "modified",
        None => "local",
    }
}

fn bump(previous: i64, now: i64) -> i64 {
    now.max(previous + 1)
}

/// Prepare a collaborator save against the persisted copy (tombstones included)
pub(crate) fn plan_save(zone: &mut Zone, persisted: Option<&Zone>, ctx: &StoreContext) -> WriteKind {
    if zone.uuid().is_none() {
        zone.uuid = persisted.and_then(|p| p.uuid.clone());
    }
    zone.ensure_uuid();
    if zone.sync_group.is_none() {
        zone.sync_group = ctx.default_sync_group.clone();
    }

    let now = ctx.clock.now();
    match persisted {
        None => {
            if !(zone.synced && zone.last_updated > 0) {
                zone.last_updated = now;
            }
            zone.deleted = false;
            WriteKind::Insert
        }
        Some(previous) if previous.deleted => {
            zone.last_updated = bump(previous.last_updated, now);
            zone.last_synced_at = previous.last_synced_at;
            zone.deleted = false;
            WriteKind::Restore
        }
        Some(previous) => {
            zone.last_synced_at = previous.last_synced_at;
            zone.synced = previous.synced;
            zone.deleted = false;
            if zone.content_differs(previous) || zone.uuid != previous.uuid {
                zone.last_updated = bump(previous.last_updated, now);
                WriteKind::Update
            } else {
                zone.last_updated = previous.last_updated;
                WriteKind::Unchanged
            }
        }
    }
}

/// Prepare a write whose timestamp is authoritative
pub(crate) fn plan_sync_record(zone: &mut Zone, persisted: Option<&Zone>) -> WriteKind {
    zone.ensure_uuid();
    if let Some(previous) = persisted {
        zone.last_updated = zone.last_updated.max(previous.last_updated);
    }
    zone.last_synced_at = Some(zone.last_updated);
    zone.synced = true;
    zone.deleted = false;

    match persisted {
        None => WriteKind::Insert,
        Some(previous) if previous.deleted => WriteKind::Restore,
        Some(_) => WriteKind::Update,
    }
}

/// Tombstone a persisted zone in place; false if it already was one
pub(crate) fn plan_delete(persisted: &mut Zone, ctx: &StoreContext) -> bool {
    if persisted.deleted {
        return false;
    }
    persisted.deleted = true;
    persisted.last_updated = bump(persisted.last_updated, ctx.clock.now());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::models::Slot;

    fn context(now: i64) -> (Arc<ManualTimeSource>, StoreContext) {
        let source = Arc::new(ManualTimeSource::new(now));
        let clock = Arc::new(SyncClock::new(source.clone()));
        (source, StoreContext::new(clock, Some("guild".to_string())))
    }

    #[test]
    fn test_insert_assigns_uuid_group_and_stamp() {
        let (_, ctx) = context(1_000);
        let mut zone = Zone::new("Bank");

        assert_eq!(plan_save(&mut zone, None, &ctx), WriteKind::Insert);
        assert!(zone.uuid().is_some());
        assert_eq!(zone.sync_group.as_deref(), Some("guild"));
        assert_eq!(zone.last_updated, 1_000);
    }

    #[test]
    fn test_unchanged_save_keeps_timestamp() {
        let (source, ctx) = context(1_000);
        let mut persisted = Zone::new("Bank");
        plan_save(&mut persisted, None, &ctx);

        source.set(9_000);
        let mut again = persisted.clone();
        assert_eq!(plan_save(&mut again, Some(&persisted), &ctx), WriteKind::Unchanged);
        assert_eq!(again.last_updated, 1_000);
    }

    #[test]
    fn test_update_keeps_uuid_and_bumps() {
        let (source, ctx) = context(1_000);
        let mut persisted = Zone::new("Bank");
        plan_save(&mut persisted, None, &ctx);

        source.set(2_000);
        let mut edited = persisted.clone();
        edited.uuid = None;
        edited.outputs.push(Slot::new("Bar"));
        assert_eq!(plan_save(&mut edited, Some(&persisted), &ctx), WriteKind::Update);
        assert_eq!(edited.uuid, persisted.uuid);
        assert_eq!(edited.last_updated, 2_000);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        // Clock moved backwards (e.g. a new offset estimate)
        let (source, ctx) = context(5_000);
        let mut persisted = Zone::new("Bank");
        plan_save(&mut persisted, None, &ctx);

        source.set(4_000);
        let mut edited = persisted.clone();
        edited.name = "Bank 2".to_string();
        plan_save(&mut edited, Some(&persisted), &ctx);
        assert_eq!(edited.last_updated, 5_001);

        let mut tombstone = edited.clone();
        assert!(plan_delete(&mut tombstone, &ctx));
        assert_eq!(tombstone.last_updated, 5_002);
        assert!(!plan_delete(&mut tombstone, &ctx));

        let mut remote = edited.clone();
        remote.last_updated = 10;
        plan_sync_record(&mut remote, Some(&tombstone));
        assert_eq!(remote.last_updated, 5_002);
        assert_eq!(remote.last_synced_at, Some(5_002));
    }

    #[test]
    fn test_restore_tombstoned_zone() {
        let (source, ctx) = context(1_000);
        let mut persisted = Zone::new("Bank");
        plan_save(&mut persisted, None, &ctx);
        plan_delete(&mut persisted, &ctx);

        source.set(3_000);
        let mut revived = persisted.clone();
        assert_eq!(plan_save(&mut revived, Some(&persisted), &ctx), WriteKind::Restore);
        assert!(!revived.deleted);
        assert_eq!(revived.last_updated, 3_000);
    }

    #[test]
    fn test_sync_status_values() {
        let mut zone = Zone::new("Bank");
        zone.last_updated = 10;
        assert_eq!(sync_status(&zone), "local");
        zone.last_synced_at = Some(10);
        assert_eq!(sync_status(&zone), "synced");
        zone.last_updated = 11;
        assert_eq!(sync_status(&zone), "modified");
    }
}
