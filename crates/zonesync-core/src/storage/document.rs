//! JSON document zone storage
//!
//! All zones live in one file shaped `{"areas": [ <zone>, ... ]}`. Every
//! write loads the whole file, mutates the map and writes everything back
//! through a temp file and rename. Tombstones stay in the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::{plan_delete, plan_save, plan_sync_record, StoreContext, ZoneStorage};
use crate::models::Zone;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ZoneDocument {
    #[serde(default)]
    areas: Vec<Zone>,
}

/// Zone storage backed by a single JSON file
#[derive(Debug)]
pub struct DocumentStore {
    path: PathBuf,
    context: StoreContext,
    /// Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>, context: StoreContext) -> Self {
        Self {
            path: path.into(),
            context,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write snapshots exactly as given (tombstones included)
    ///
    /// Used to mirror zones already written by the primary backend.
    pub fn mirror(&self, zones: &[Zone]) -> StorageResult<()> {
        if zones.is_empty() {
            return Ok(());
        }
        let _guard = self.guard();
        let mut all = self.read_all()?;
        for zone in zones {
            all.insert(zone.id, zone.clone());
        }
        self.write_all(&all)
    }

    /// Every zone in the file, tombstones included
    fn read_all(&self) -> StorageResult<BTreeMap<i64, Zone>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StorageError::ReadError {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: ZoneDocument =
            serde_json::from_str(&content).map_err(|e| StorageError::InvalidFormat {
                path: self.path.clone(),
                details: e.to_string(),
            })?;
        Ok(document
            .areas
            .into_iter()
            .map(|zone| (zone.id, zone))
            .collect())
    }

    fn write_all(&self, zones: &BTreeMap<i64, Zone>) -> StorageResult<()> {
        let document = ZoneDocument {
            areas: zones.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&document)?;
        atomic_write(&self.path, &data)?;
        debug!("Wrote {} zones to {:?}", zones.len(), self.path);
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(zones: &BTreeMap<i64, Zone>) -> i64 {
        zones.keys().next_back().map_or(1, |max| max + 1)
    }
}

impl ZoneStorage for DocumentStore {
    fn load_all(&self) -> StorageResult<BTreeMap<i64, Zone>> {
        let _guard = self.guard();
        let mut zones = self.read_all()?;
        zones.retain(|_, zone| !zone.deleted);
        Ok(zones)
    }

    fn save(&self, zone: &mut Zone) -> StorageResult<()> {
        let _guard = self.guard();
        let mut all = self.read_all()?;

        let mut candidate = zone.clone();
        if candidate.id <= 0 {
            candidate.id = Self::next_id(&all);
        }
        let id = candidate.id;
        plan_save(&mut candidate, all.get(&id), &self.context);
        all.insert(candidate.id, candidate.clone());
        self.write_all(&all)?;

        *zone = candidate;
        Ok(())
    }

    fn record_sync(&self, zone: &mut Zone) -> StorageResult<()> {
        let _guard = self.guard();
        let mut all = self.read_all()?;

        let mut candidate = zone.clone();
        if candidate.id <= 0 {
            candidate.id = Self::next_id(&all);
        }
        if candidate.sync_group.is_none() {
            candidate.sync_group = self.context.default_sync_group.clone();
        }
        let id = candidate.id;
        plan_sync_record(&mut candidate, all.get(&id));
        all.insert(candidate.id, candidate.clone());
        self.write_all(&all)?;

        *zone = candidate;
        Ok(())
    }

    fn delete(&self, id: i64) -> StorageResult<Option<Zone>> {
        let _guard = self.guard();
        let mut all = self.read_all()?;
        let tombstone = match all.get_mut(&id) {
            Some(zone) => {
                if !plan_delete(zone, &self.context) {
                    return Ok(None);
                }
                zone.clone()
            }
            None => return Ok(None),
        };
        self.write_all(&all)?;
        Ok(Some(tombstone))
    }

    fn get_by_id(&self, id: i64) -> StorageResult<Option<Zone>> {
        let _guard = self.guard();
        Ok(self.read_all()?.remove(&id).filter(|zone| !zone.deleted))
    }

    fn is_available(&self) -> bool {
        !self.path.as_os_str().is_empty() && !self.path.is_dir()
    }

    fn kind(&self) -> &'static str {
        "document"
    }
}

/// Write via a temp file in the same directory and rename into place
fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::from_io(e, path.to_path_buf()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, SyncClock};
    use crate::models::{Rect, Slot};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> (Arc<ManualTimeSource>, DocumentStore) {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let context = StoreContext::new(Arc::new(SyncClock::new(time.clone())), None);
        (
            time,
            DocumentStore::new(temp_dir.path().join("areas.json"), context),
        )
    }

    #[test]
    fn test_missing_and_empty_file_load_empty() {
        let temp_dir = TempDir::new().unwrap();
        let (_, store) = store(&temp_dir);
        assert!(store.load_all().unwrap().is_empty());

        fs::write(store.path(), "  \n").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_and_file_shape() {
        let temp_dir = TempDir::new().unwrap();
        let (_, store) = store(&temp_dir);

        let mut zone = Zone::new("Quarry");
        zone.extents.insert(7, Rect::new(1, 1, 2, 2));
        zone.outputs.push(Slot::new("Stone").with_threshold(3));
        store.save(&mut zone).unwrap();

        assert_eq!(zone.id, 1);
        assert_eq!(store.get_by_id(1).unwrap(), Some(zone.clone()));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["areas"].as_array().unwrap().len(), 1);
        assert_eq!(raw["areas"][0]["name"], "Quarry");
    }

    #[test]
    fn test_delete_keeps_tombstone_in_file() {
        let temp_dir = TempDir::new().unwrap();
        let (time, store) = store(&temp_dir);
        let mut zone = Zone::new("Quarry");
        store.save(&mut zone).unwrap();

        time.set(2_000);
        assert!(store.delete(zone.id).unwrap().is_some());
        assert!(store.delete(zone.id).unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.get_by_id(zone.id).unwrap().is_none());

        let mut next = Zone::new("Next");
        store.save(&mut next).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn test_update_and_sync_record_see_persisted_copy() {
        let temp_dir = TempDir::new().unwrap();
        let (_, store) = store(&temp_dir);
        let mut zone = Zone::new("Quarry");
        store.save(&mut zone).unwrap();
        let uuid = zone.uuid.clone();

        // Same clock reading, changed content: stamp still moves forward
        zone.name = "Deep quarry".to_string();
        zone.uuid = None;
        store.save(&mut zone).unwrap();
        assert_eq!(zone.last_updated, 1_001);
        assert_eq!(zone.uuid, uuid);

        // An older authoritative stamp never lowers the persisted one
        let mut remote = zone.clone();
        remote.last_updated = 900;
        store.record_sync(&mut remote).unwrap();
        let stored = store.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(stored.last_updated, 1_001);
        assert_eq!(stored.last_synced_at, Some(1_001));
    }

    #[test]
    fn test_mirror_writes_snapshot_verbatim() {
        let temp_dir = TempDir::new().unwrap();
        let (_, store) = store(&temp_dir);

        let mut zone = Zone::new("Mirrored");
        zone.id = 42;
        zone.uuid = Some("u-42".to_string());
        zone.last_updated = 77;
        store.mirror(&[zone.clone()]).unwrap();

        assert_eq!(store.get_by_id(42).unwrap(), Some(zone));
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (_, store) = store(&temp_dir);
        fs::write(store.path(), "{ not json").unwrap();

        let err = store.load_all().unwrap_err();
        assert!(matches!(err, StorageError::InvalidFormat { .. }));
    }
}
