//! SQLite zone storage
//!
//! Each zone is one row in `areas` plus four child row-sets. Updates replace
//! every child row (delete, then reinsert) instead of diffing them.
//!
//! ## Tables
//!
//! - `areas` - zone identity, appearance, timestamps and tombstone flag
//! - `area_spaces` - grid segment rectangles
//! - `area_inputs` / `area_outputs` - slots, icon metadata as JSON
//! - `area_specialisations` - ordered specializations
//!
//! Lock contention (SQLITE_BUSY / SQLITE_LOCKED) is retried with a linear
//! backoff and a fresh connection between attempts.

use chrono::{DateTime, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::{ConnectionManager, ConnectionOptions};
use super::error::{StorageError, StorageResult};
use super::{plan_delete, plan_save, plan_sync_record, sync_status, StoreContext, WriteKind, ZoneStorage};
use crate::config::Config;
use crate::models::{Color, IconData, Rect, Slot, Specialization, Zone};

const ZONE_COLUMNS: &str = "id, global_id, name, path, color_r, color_g, color_b, color_a, \
     hide, updated_at, last_sync_at, deleted, zone_sync";

/// How lock contention is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Zone storage backed by SQLite
#[derive(Debug)]
pub struct RelationalStore {
    connection: ConnectionManager,
    context: StoreContext,
    retry: RetryPolicy,
}

impl RelationalStore {
    /// Open the database described by `config`
    pub fn open(config: &Config, context: StoreContext) -> StorageResult<Self> {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(config.lock_retry_base_ms),
            ..RetryPolicy::default()
        };
        Self::open_with(ConnectionOptions::from_config(config), retry, context)
    }

    pub fn open_with(
        options: ConnectionOptions,
        retry: RetryPolicy,
        context: StoreContext,
    ) -> StorageResult<Self> {
        Ok(Self {
            connection: ConnectionManager::open(options)?,
            context,
            retry,
        })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Number of stored zones, tombstones included
    pub fn row_count(&self) -> StorageResult<i64> {
        self.with_retry("count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM areas", [], |row| row.get(0))?)
        })
    }

    /// Close the connection
    pub fn shutdown(&self) {
        self.connection.close();
    }

    fn with_retry<T>(
        &self,
        operation: &str,
        mut f: impl FnMut(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.connection.with_connection(&mut f) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_lock_contention() {
                return Err(err);
            }

            if attempt >= self.retry.attempts {
                debug!("Database still locked after {} attempts ({})", attempt, operation);
                return Err(match err {
                    StorageError::Database(source) => StorageError::Locked {
                        attempts: attempt,
                        source,
                    },
                    other => other,
                });
            }

            let delay = self.retry.base_delay * attempt;
            debug!(
                "Database locked during {} (attempt {}/{}), retrying in {:?}",
                operation, attempt, self.retry.attempts, delay
            );
            std::thread::sleep(delay);
            if let Err(e) = self.connection.reconnect() {
                warn!("Reconnect after lock contention failed: {}", e);
            }
        }
    }
}

impl ZoneStorage for RelationalStore {
    fn load_all(&self) -> StorageResult<BTreeMap<i64, Zone>> {
        self.with_retry("load", |conn| {
            let mut zones = query_zones(conn, "WHERE deleted = 0", None)?;
            attach_children(conn, &mut zones, None)?;
            Ok(zones)
        })
    }

    fn save(&self, zone: &mut Zone) -> StorageResult<()> {
        let context = &self.context;
        let saved = self.with_retry("save", |conn| {
            let tx = conn.transaction()?;
            let mut candidate = zone.clone();
            let persisted = if candidate.id > 0 {
                fetch_zone(&tx, candidate.id)?
            } else {
                candidate.id = next_id(&tx)?;
                None
            };

            let kind = plan_save(&mut candidate, persisted.as_ref(), context);
            write_zone(&tx, &candidate, kind, context.clock.now())?;
            tx.commit()?;
            debug!("Saved zone {} ({:?})", candidate.id, kind);
            Ok(candidate)
        })?;
        *zone = saved;
        Ok(())
    }

    fn record_sync(&self, zone: &mut Zone) -> StorageResult<()> {
        let context = &self.context;
        let saved = self.with_retry("record sync", |conn| {
            let tx = conn.transaction()?;
            let mut candidate = zone.clone();
            let persisted = if candidate.id > 0 {
                fetch_zone(&tx, candidate.id)?
            } else {
                candidate.id = next_id(&tx)?;
                None
            };

            if candidate.sync_group.is_none() {
                candidate.sync_group = context.default_sync_group.clone();
            }
            let kind = plan_sync_record(&mut candidate, persisted.as_ref());
            write_zone(&tx, &candidate, kind, context.clock.now())?;
            tx.commit()?;
            Ok(candidate)
        })?;
        *zone = saved;
        Ok(())
    }

    fn delete(&self, id: i64) -> StorageResult<Option<Zone>> {
        let context = &self.context;
        self.with_retry("delete", |conn| {
            let tx = conn.transaction()?;
            let Some(mut zone) = fetch_zone(&tx, id)? else {
                return Ok(None);
            };
            if !plan_delete(&mut zone, context) {
                return Ok(None);
            }
            tx.execute(
                "UPDATE areas SET deleted = 1, updated_at = ?2, \
                 sync_version = COALESCE(sync_version, 0) + 1 WHERE id = ?1",
                params![id, zone.last_updated],
            )?;
            tx.commit()?;
            Ok(Some(zone))
        })
    }

    fn get_by_id(&self, id: i64) -> StorageResult<Option<Zone>> {
        self.with_retry("get", |conn| {
            Ok(fetch_zone(conn, id)?.filter(|zone| !zone.deleted))
        })
    }

    fn is_available(&self) -> bool {
        self.connection.is_available()
    }

    fn kind(&self) -> &'static str {
        "database"
    }
}

// ==================== Query Helpers ====================

/// A zone by id, tombstoned or not, with its children
fn fetch_zone(conn: &Connection, id: i64) -> StorageResult<Option<Zone>> {
    let mut zones = query_zones(conn, "WHERE id = ?1", Some(id))?;
    if zones.is_empty() {
        return Ok(None);
    }
    attach_children(conn, &mut zones, Some(id))?;
    Ok(zones.remove(&id))
}

fn next_id(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM areas", [], |row| {
        row.get(0)
    })?)
}

fn query_zones(
    conn: &Connection,
    clause: &str,
    id: Option<i64>,
) -> StorageResult<BTreeMap<i64, Zone>> {
    let sql = format!("SELECT {} FROM areas {}", ZONE_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = match id {
        Some(id) => stmt.query_map(params![id], hydrate_zone)?,
        None => stmt.query_map([], hydrate_zone)?,
    };

    let mut zones = BTreeMap::new();
    for zone in rows {
        let zone = zone?;
        zones.insert(zone.id, zone);
    }
    Ok(zones)
}

fn hydrate_zone(row: &Row<'_>) -> rusqlite::Result<Zone> {
    let channel = |idx: usize, default: u8| -> rusqlite::Result<u8> {
        Ok(row
            .get::<_, Option<i64>>(idx)?
            .map_or(default, |v| v.clamp(0, 255) as u8))
    };
    let fallback = Color::default();

    let mut zone = Zone::new(row.get::<_, String>(2)?);
    zone.id = row.get(0)?;
    zone.uuid = row.get::<_, Option<String>>(1)?.filter(|u| !u.is_empty());
    zone.path = row.get::<_, Option<String>>(3)?.unwrap_or_default();
    zone.color = Color::new(
        channel(4, fallback.r)?,
        channel(5, fallback.g)?,
        channel(6, fallback.b)?,
        channel(7, fallback.a)?,
    );
    zone.hide = row.get::<_, Option<i64>>(8)?.unwrap_or(0) != 0;
    zone.last_updated = read_timestamp(row.get_ref(9)?).unwrap_or(0);
    zone.last_synced_at = read_timestamp(row.get_ref(10)?);
    zone.synced = zone.last_synced_at.is_some();
    zone.deleted = row.get::<_, Option<i64>>(11)?.unwrap_or(0) != 0;
    zone.sync_group = row.get::<_, Option<String>>(12)?.filter(|g| !g.is_empty());
    Ok(zone)
}

/// Timestamps are epoch millis; rows written by older builds hold text
fn read_timestamp(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(millis) => Some(millis),
        ValueRef::Real(millis) => Some(millis as i64),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).ok()?.trim();
            if let Ok(millis) = text.parse::<i64>() {
                return Some(millis);
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().timestamp_millis())
        }
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

fn parse_icon(raw: Option<String>, area_id: i64) -> Option<IconData> {
    let raw = raw.filter(|r| !r.trim().is_empty())?;
    match serde_json::from_str(&raw) {
        Ok(icon) => Some(icon),
        Err(e) => {
            debug!("Ignoring unreadable icon data on zone {}: {}", area_id, e);
            None
        }
    }
}

fn attach_children(
    conn: &Connection,
    zones: &mut BTreeMap<i64, Zone>,
    area_id: Option<i64>,
) -> StorageResult<()> {
    let mut stmt = conn.prepare(
        "SELECT area_id, grid_id, begin_x, begin_y, end_x, end_y FROM area_spaces \
         WHERE (?1 IS NULL OR area_id = ?1) ORDER BY id",
    )?;
    let spaces = stmt.query_map(params![area_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            Rect::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
        ))
    })?;
    for space in spaces {
        let (owner, grid_id, rect) = space?;
        if let Some(zone) = zones.get_mut(&owner) {
            zone.extents.insert(grid_id, rect);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT area_id, name, type, icon_data FROM area_inputs \
         WHERE (?1 IS NULL OR area_id = ?1) ORDER BY id",
    )?;
    let inputs = stmt.query_map(params![area_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;
    for input in inputs {
        let (owner, name, kind, icon) = input?;
        if let Some(zone) = zones.get_mut(&owner) {
            zone.inputs.push(Slot {
                name,
                kind,
                threshold: None,
                icon: parse_icon(icon, owner),
            });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT area_id, name, type, th, icon_data FROM area_outputs \
         WHERE (?1 IS NULL OR area_id = ?1) ORDER BY id",
    )?;
    let outputs = stmt.query_map(params![area_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<i32>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    for output in outputs {
        let (owner, name, kind, threshold, icon) = output?;
        if let Some(zone) = zones.get_mut(&owner) {
            zone.outputs.push(Slot {
                name,
                kind,
                threshold: threshold.filter(|th| *th >= 0),
                icon: parse_icon(icon, owner),
            });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT area_id, name, subtype FROM area_specialisations \
         WHERE (?1 IS NULL OR area_id = ?1) ORDER BY id",
    )?;
    let specs = stmt.query_map(params![area_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;
    for spec in specs {
        let (owner, name, subtype) = spec?;
        if let Some(zone) = zones.get_mut(&owner) {
            zone.specializations.push(Specialization { name, subtype });
        }
    }

    Ok(())
}

// ==================== Write Helpers ====================

fn write_zone(tx: &Transaction, zone: &Zone, kind: WriteKind, now: i64) -> StorageResult<()> {
    match kind {
        WriteKind::Unchanged => return Ok(()),
        WriteKind::Insert => {
            tx.execute(
                "INSERT INTO areas (id, global_id, name, path, color_r, color_g, color_b, color_a, \
                 hide, created_at, updated_at, sync_version, sync_status, last_sync_at, deleted, \
                 zone_sync) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?13, 0, ?14)",
                params![
                    zone.id,
                    zone.uuid,
                    zone.name,
                    zone.path,
                    zone.color.r,
                    zone.color.g,
                    zone.color.b,
                    zone.color.a,
                    zone.hide,
                    now,
                    zone.last_updated,
                    sync_status(zone),
                    zone.last_synced_at,
                    zone.sync_group,
                ],
            )?;
        }
        WriteKind::Update | WriteKind::Restore => {
            tx.execute(
                "UPDATE areas SET global_id = ?2, name = ?3, path = ?4, color_r = ?5, color_g = ?6, \
                 color_b = ?7, color_a = ?8, hide = ?9, updated_at = ?10, \
                 sync_version = COALESCE(sync_version, 0) + 1, sync_status = ?11, \
                 last_sync_at = ?12, deleted = 0, zone_sync = ?13 WHERE id = ?1",
                params![
                    zone.id,
                    zone.uuid,
                    zone.name,
                    zone.path,
                    zone.color.r,
                    zone.color.g,
                    zone.color.b,
                    zone.color.a,
                    zone.hide,
                    zone.last_updated,
                    sync_status(zone),
                    zone.last_synced_at,
                    zone.sync_group,
                ],
            )?;
        }
    }
    replace_children(tx, zone)
}

fn replace_children(tx: &Transaction, zone: &Zone) -> StorageResult<()> {
    for table in [
        "area_spaces",
        "area_inputs",
        "area_outputs",
        "area_specialisations",
    ] {
        tx.execute(
            &format!("DELETE FROM {} WHERE area_id = ?1", table),
            params![zone.id],
        )?;
    }

    for (grid_id, rect) in &zone.extents {
        tx.execute(
            "INSERT INTO area_spaces (area_id, grid_id, begin_x, begin_y, end_x, end_y) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![zone.id, grid_id, rect.begin_x, rect.begin_y, rect.end_x, rect.end_y],
        )?;
    }

    for input in &zone.inputs {
        tx.execute(
            "INSERT INTO area_inputs (area_id, name, type, icon_data) VALUES (?1, ?2, ?3, ?4)",
            params![zone.id, input.name, input.kind, encode_icon(&input.icon)?],
        )?;
    }

    for output in &zone.outputs {
        tx.execute(
            "INSERT INTO area_outputs (area_id, name, type, th, icon_data) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                zone.id,
                output.name,
                output.kind,
                output.threshold,
                encode_icon(&output.icon)?
            ],
        )?;
    }

    for spec in &zone.specializations {
        tx.execute(
            "INSERT INTO area_specialisations (area_id, name, subtype) VALUES (?1, ?2, ?3)",
            params![zone.id, spec.name, spec.subtype],
        )?;
    }

    Ok(())
}

fn encode_icon(icon: &Option<IconData>) -> StorageResult<Option<String>> {
    icon.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, SyncClock};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        time: Arc<ManualTimeSource>,
        store: RelationalStore,
        path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("areas.db");
        let time = Arc::new(ManualTimeSource::new(1_000));
        let context = StoreContext::new(
            Arc::new(SyncClock::new(time.clone())),
            Some("guild".to_string()),
        );
        let mut options = ConnectionOptions::new(&path);
        options.busy_timeout = Duration::from_millis(20);
        let retry = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let store = RelationalStore::open_with(options, retry, context).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            time,
            store,
            path,
        }
    }

    fn full_zone() -> Zone {
        let mut zone = Zone::new("Smithy");
        zone.path = "Town/North".to_string();
        zone.color = Color::new(10, 20, 30, 40);
        zone.hide = true;
        zone.extents.insert(12850, Rect::new(1, 2, 3, 4));
        zone.extents.insert(12851, Rect::new(0, 0, 63, 63));
        zone.specializations.push(Specialization::with_subtype("smith", "gold"));
        zone.specializations.push(Specialization::new("cook"));
        zone.inputs.push(Slot::new("Ore").with_kind("item").with_icon(IconData {
            layer: Some("ores".to_string()),
            static_image: Some("ore.png".to_string()),
        }));
        zone.outputs.push(Slot::new("Bar").with_kind("item").with_threshold(25));
        zone.outputs.push(Slot::new("Slag"));
        zone
    }

    #[test]
    fn test_round_trip_every_field() {
        let f = fixture();
        let mut zone = full_zone();
        f.store.save(&mut zone).unwrap();

        assert_eq!(zone.id, 1);
        assert_eq!(zone.last_updated, 1_000);
        let loaded = f.store.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(loaded, zone);

        let all = f.store.load_all().unwrap();
        assert_eq!(all.get(&zone.id), Some(&zone));
    }

    #[test]
    fn test_round_trip_empty_collections() {
        let f = fixture();
        let mut zone = Zone::new("Empty");
        f.store.save(&mut zone).unwrap();

        let loaded = f.store.get_by_id(zone.id).unwrap().unwrap();
        assert!(loaded.extents.is_empty());
        assert!(loaded.inputs.is_empty());
        assert!(loaded.outputs.is_empty());
        assert!(loaded.specializations.is_empty());
        assert_eq!(loaded, zone);
    }

    #[test]
    fn test_update_replaces_children() {
        let f = fixture();
        let mut zone = full_zone();
        f.store.save(&mut zone).unwrap();

        f.time.set(2_000);
        zone.extents.clear();
        zone.extents.insert(1, Rect::new(5, 5, 6, 6));
        zone.outputs.truncate(1);
        f.store.save(&mut zone).unwrap();

        let loaded = f.store.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(loaded.extents.len(), 1);
        assert_eq!(loaded.outputs.len(), 1);
        assert_eq!(loaded.last_updated, 2_000);
    }

    #[test]
    fn test_unchanged_save_writes_nothing() {
        let f = fixture();
        let mut zone = full_zone();
        f.store.save(&mut zone).unwrap();

        f.time.set(5_000);
        let mut again = zone.clone();
        again.inputs.reverse();
        f.store.save(&mut again).unwrap();

        assert_eq!(again.last_updated, 1_000);
        let version: i64 = f
            .store
            .connection()
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT sync_version FROM areas WHERE id = ?1",
                    params![zone.id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_delete_tombstones_and_ids_are_not_reused() {
        let f = fixture();
        let mut first = Zone::new("First");
        f.store.save(&mut first).unwrap();

        f.time.set(1_500);
        let tombstone = f.store.delete(first.id).unwrap().unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.last_updated, 1_500);
        assert!(f.store.delete(first.id).unwrap().is_none());
        assert!(f.store.get_by_id(first.id).unwrap().is_none());
        assert!(f.store.load_all().unwrap().is_empty());
        assert_eq!(f.store.row_count().unwrap(), 1);

        let mut second = Zone::new("Second");
        f.store.save(&mut second).unwrap();
        assert_eq!(second.id, first.id + 1);
    }

    #[test]
    fn test_save_restores_tombstone() {
        let f = fixture();
        let mut zone = full_zone();
        f.store.save(&mut zone).unwrap();
        f.store.delete(zone.id).unwrap();

        f.time.set(9_000);
        f.store.save(&mut zone).unwrap();

        let restored = f.store.get_by_id(zone.id).unwrap().unwrap();
        assert!(!restored.deleted);
        assert_eq!(restored.last_updated, 9_000);
        assert_eq!(restored.outputs.len(), 2);
    }

    #[test]
    fn test_record_sync_keeps_timestamp_and_sets_marker() {
        let f = fixture();
        let mut zone = full_zone();
        zone.uuid = Some("remote-1".to_string());
        zone.last_updated = 1_005;
        f.time.set(50_000);
        f.store.record_sync(&mut zone).unwrap();

        let loaded = f.store.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(loaded.last_updated, 1_005);
        assert_eq!(loaded.last_synced_at, Some(1_005));
        assert!(loaded.synced);
        assert_eq!(loaded.uuid.as_deref(), Some("remote-1"));
    }

    #[test]
    fn test_reads_legacy_text_timestamps() {
        let f = fixture();
        f.store
            .connection()
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO areas (id, name, updated_at, last_sync_at) \
                     VALUES (3, 'Old', '2024-01-02 03:04:05', NULL)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let zone = f.store.get_by_id(3).unwrap().unwrap();
        assert_eq!(zone.last_updated, 1_704_164_645_000);
        assert_eq!(zone.color, Color::default());
        assert!(!zone.synced);
    }

    #[test]
    fn test_lock_contention_is_retried_then_reported() {
        let f = fixture();
        let mut zone = Zone::new("Contended");
        f.store.save(&mut zone).unwrap();

        let locker = Connection::open(&f.path).unwrap();
        locker
            .execute_batch("BEGIN EXCLUSIVE; UPDATE areas SET name = 'held' WHERE id = 1;")
            .unwrap();

        zone.name = "Renamed".to_string();
        let err = f.store.save(&mut zone).unwrap_err();
        assert!(err.is_lock_contention());
        assert!(matches!(err, StorageError::Locked { attempts: 3, .. }));

        locker.execute_batch("ROLLBACK;").unwrap();
        f.store.save(&mut zone).unwrap();
        assert_eq!(f.store.get_by_id(1).unwrap().unwrap().name, "Renamed");
    }
}
