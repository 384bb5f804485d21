//! Zone repository
//!
//! The façade collaborators use to persist zones. It picks the backend
//! through [`StorageSelector`], throttles collaborator writes, mirrors every
//! database write into the JSON backup and tells the sync worker about
//! local changes.
//!
//! ## Throttling
//!
//! - Two persisted collaborator writes are at least `save_throttle` apart;
//!   a save inside the window is dropped, not queued.
//! - A zone saved within the window is skipped even if the global timer
//!   would let it through.
//! - For `load_grace` after a bulk load, [`ZoneRepository::save_all`] is
//!   suppressed entirely.
//!
//! The engine-facing operations ([`snapshot`](ZoneRepository::snapshot),
//! [`apply_remote`](ZoneRepository::apply_remote),
//! [`record_sync`](ZoneRepository::record_sync),
//! [`remove_synced`](ZoneRepository::remove_synced)) bypass throttling so
//! sync results are never dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::clock::SyncClock;
use crate::config::Config;
use crate::executor::{TaskExecutor, TaskHandle, TaskPriority};
use crate::models::Zone;
use crate::storage::{StorageResult, StorageSelector, StoreContext, ZoneStorage};
use crate::sync::SyncNotifier;

pub const SAVE_THROTTLE: Duration = Duration::from_secs(2);
pub const LOAD_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub save_throttle: Duration,
    pub load_grace: Duration,
    /// Mirror database writes into the JSON backup
    pub mirror: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            save_throttle: SAVE_THROTTLE,
            load_grace: LOAD_GRACE,
            mirror: true,
        }
    }
}

/// Result of a collaborator save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another write happened inside the throttle window
    Throttled,
    /// This zone was saved inside the throttle window
    RecentlySaved,
    /// The database stayed locked through every retry
    Contended,
}

impl SaveOutcome {
    pub fn is_saved(self) -> bool {
        self == SaveOutcome::Saved
    }
}

/// Counts from a bulk save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub saved: usize,
    pub skipped: usize,
    pub contended: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_write: Option<i64>,
    last_load: Option<i64>,
    recent: HashMap<i64, i64>,
}

impl ThrottleState {
    fn within(at: Option<i64>, now: i64, window: Duration) -> bool {
        at.is_some_and(|at| now - at < window.as_millis() as i64)
    }

    fn record_write(&mut self, id: i64, now: i64, window: Duration) {
        self.last_write = Some(now);
        self.recent.insert(id, now);
        let window = window.as_millis() as i64;
        self.recent.retain(|_, at| now - *at < window);
    }
}

pub struct ZoneRepository {
    selector: StorageSelector,
    clock: Arc<SyncClock>,
    options: RepositoryOptions,
    throttle: Mutex<ThrottleState>,
    notifier: Mutex<Option<SyncNotifier>>,
}

impl ZoneRepository {
    pub fn open(config: &Config, clock: Arc<SyncClock>) -> Result<Self> {
        Self::open_with(config, clock, RepositoryOptions::default())
    }

    pub fn open_with(config: &Config, clock: Arc<SyncClock>, options: RepositoryOptions) -> Result<Self> {
        config
            .ensure_data_dir()
            .context("Failed to prepare zone data directory")?;
        let context = StoreContext::new(clock.clone(), config.sync_group.clone());
        Ok(Self {
            selector: StorageSelector::new(config.clone(), context),
            clock,
            options,
            throttle: Mutex::new(ThrottleState::default()),
            notifier: Mutex::new(None),
        })
    }

    pub fn clock(&self) -> &Arc<SyncClock> {
        &self.clock
    }

    pub fn is_using_database(&self) -> bool {
        self.selector.is_using_database()
    }

    /// Backend name for status output
    pub fn backend(&self) -> &'static str {
        self.selector.active().kind()
    }

    /// Route local changes and deletions to a sync worker
    pub fn attach_sync(&self, notifier: SyncNotifier) {
        *lock(&self.notifier) = Some(notifier);
    }

    pub fn detach_sync(&self) {
        lock(&self.notifier).take();
    }

    /// Persist one zone unless throttled
    ///
    /// The zone is updated in place with its id, uuid and timestamp.
    pub fn save(&self, zone: &mut Zone) -> StorageResult<SaveOutcome> {
        let now = self.clock.local_now();
        {
            let throttle = lock(&self.throttle);
            if ThrottleState::within(throttle.last_write, now, self.options.save_throttle) {
                debug!("Save of zone {} throttled", zone.id);
                return Ok(SaveOutcome::Throttled);
            }
            if zone.id > 0
                && ThrottleState::within(throttle.recent.get(&zone.id).copied(), now, self.options.save_throttle)
            {
                debug!("Zone {} saved recently, skipping", zone.id);
                return Ok(SaveOutcome::RecentlySaved);
            }
        }

        let outcome = self.persist(zone)?;
        if outcome.is_saved() {
            lock(&self.throttle).record_write(zone.id, now, self.options.save_throttle);
        }
        Ok(outcome)
    }

    /// Persist many zones, tolerating individual failures
    ///
    /// Suppressed entirely during the post-load grace period and inside the
    /// global throttle window. Zones saved recently are skipped.
    pub fn save_all(&self, zones: &mut [Zone]) -> BatchReport {
        let now = self.clock.local_now();
        let mut report = BatchReport::default();
        {
            let throttle = lock(&self.throttle);
            if ThrottleState::within(throttle.last_load, now, self.options.load_grace) {
                debug!("Bulk save of {} zones suppressed after load", zones.len());
                report.skipped = zones.len();
                return report;
            }
            if ThrottleState::within(throttle.last_write, now, self.options.save_throttle) {
                debug!("Bulk save of {} zones throttled", zones.len());
                report.skipped = zones.len();
                return report;
            }
        }

        let mut written = Vec::new();
        for zone in zones.iter_mut() {
            let recent = zone.id > 0 && {
                let throttle = lock(&self.throttle);
                ThrottleState::within(throttle.recent.get(&zone.id).copied(), now, self.options.save_throttle)
            };
            if recent {
                report.skipped += 1;
                continue;
            }

            match self.persist(zone) {
                Ok(SaveOutcome::Saved) => {
                    report.saved += 1;
                    written.push(zone.id);
                }
                Ok(SaveOutcome::Contended) => report.contended += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to save zone {} ({}): {:?}", zone.id, e, e);
                }
            }
        }

        if !written.is_empty() {
            let mut throttle = lock(&self.throttle);
            for id in written {
                throttle.record_write(id, now, self.options.save_throttle);
            }
        }
        info!(
            "Bulk save: {} saved, {} skipped, {} contended, {} failed",
            report.saved, report.skipped, report.contended, report.failed
        );
        report
    }

    /// Tombstone a zone and propagate the deletion
    ///
    /// Returns false if no live zone had this id.
    pub fn delete(&self, id: i64) -> StorageResult<bool> {
        let store = self.selector.active();
        let Some(existing) = store.get_by_id(id)? else {
            return Ok(false);
        };
        let Some(tombstone) = store.delete(id)? else {
            return Ok(false);
        };
        self.mirror(&tombstone);
        info!("Deleted zone {} ({})", id, existing.name);

        match tombstone.uuid() {
            Some(uuid) => {
                if let Some(notifier) = lock(&self.notifier).as_ref() {
                    notifier.delete_remote(uuid, tombstone.sync_group.clone());
                }
            }
            None => warn!("Zone {} has no uuid; deletion stays local", id),
        }
        Ok(true)
    }

    /// All live zones; starts the post-load grace period
    pub fn load_all(&self) -> StorageResult<BTreeMap<i64, Zone>> {
        let zones = self.selector.active().load_all()?;
        lock(&self.throttle).last_load = Some(self.clock.local_now());
        debug!("Loaded {} zones", zones.len());
        Ok(zones)
    }

    pub fn get_by_id(&self, id: i64) -> StorageResult<Option<Zone>> {
        self.selector.active().get_by_id(id)
    }

    /// Fresh copy of every live zone, without touching throttle state
    pub fn snapshot(&self) -> StorageResult<BTreeMap<i64, Zone>> {
        self.selector.active().load_all()
    }

    /// Persist a zone created or merged from the server
    ///
    /// Its timestamp is kept and the zone counts as recently saved, so a
    /// collaborator's older in-memory copy is not written straight back.
    pub fn apply_remote(&self, zone: &mut Zone) -> StorageResult<()> {
        self.record_sync(zone)?;
        let now = self.clock.local_now();
        lock(&self.throttle).recent.insert(zone.id, now);
        Ok(())
    }

    /// Persist the sync marker for a zone the server now has
    pub fn record_sync(&self, zone: &mut Zone) -> StorageResult<()> {
        self.selector.active().record_sync(zone)?;
        self.mirror(zone);
        Ok(())
    }

    /// Tombstone a zone the server no longer has; nothing is sent back
    pub fn remove_synced(&self, id: i64) -> StorageResult<Option<Zone>> {
        let tombstone = self.selector.active().delete(id)?;
        if let Some(tombstone) = &tombstone {
            self.mirror(tombstone);
        }
        Ok(tombstone)
    }

    /// Save on a background worker at write priority
    pub fn submit_save(
        self: &Arc<Self>,
        executor: &TaskExecutor,
        mut zone: Zone,
    ) -> Option<TaskHandle<StorageResult<(SaveOutcome, Zone)>>> {
        let repository = self.clone();
        executor.submit(TaskPriority::Write, move || {
            let outcome = repository.save(&mut zone)?;
            Ok((outcome, zone))
        })
    }

    /// Load on a background worker at read priority
    pub fn submit_load_all(
        self: &Arc<Self>,
        executor: &TaskExecutor,
    ) -> Option<TaskHandle<StorageResult<BTreeMap<i64, Zone>>>> {
        let repository = self.clone();
        executor.submit(TaskPriority::Read, move || repository.load_all())
    }

    /// Copy zones from the JSON file into an empty database
    ///
    /// Returns how many zones were imported. Ids, uuids and sync markers are
    /// kept.
    pub fn migrate_from_document(&self) -> Result<usize> {
        let Some(database) = self.selector.primary() else {
            anyhow::bail!("Zone database is not available");
        };
        let existing = database.row_count().context("Failed to inspect zone database")?;
        if existing > 0 {
            info!("Zone database already has {} rows; skipping import", existing);
            return Ok(0);
        }

        let zones = self
            .selector
            .fallback()
            .load_all()
            .context("Failed to read JSON zone file")?;
        let mut imported = 0;
        for (_, mut zone) in zones {
            let result = if zone.last_synced_at.is_some() {
                database.record_sync(&mut zone)
            } else {
                database.save(&mut zone)
            };
            result.with_context(|| format!("Failed to import zone {} ({})", zone.id, zone.name))?;
            imported += 1;
        }
        info!("Imported {} zones from JSON", imported);
        Ok(imported)
    }

    /// Forget backend choice and throttle state
    pub fn reset(&self) {
        self.selector.reset();
        *lock(&self.throttle) = ThrottleState::default();
    }

    pub fn shutdown(&self) {
        self.detach_sync();
        self.selector.shutdown();
        debug!("Zone repository shut down");
    }

    fn persist(&self, zone: &mut Zone) -> StorageResult<SaveOutcome> {
        let before = (zone.id, zone.last_updated);
        match self.selector.active().save(zone) {
            Ok(()) => {}
            Err(e) if e.is_lock_contention() => {
                warn!("Zone {} not saved, database locked: {}", zone.id, e);
                return Ok(SaveOutcome::Contended);
            }
            Err(e) => return Err(e),
        }

        self.mirror(zone);
        if before != (zone.id, zone.last_updated) {
            if let Some(notifier) = lock(&self.notifier).as_ref() {
                notifier.local_change(zone.id);
            }
        }
        Ok(SaveOutcome::Saved)
    }

    /// Best-effort copy into the JSON backup while the database is primary
    fn mirror(&self, zone: &Zone) {
        if !self.options.mirror || !self.selector.is_using_database() {
            return;
        }
        if let Err(e) = self.selector.fallback().mirror(std::slice::from_ref(zone)) {
            warn!("Failed to mirror zone {} to JSON backup: {}", zone.id, e);
        }
    }
}

impl std::fmt::Debug for ZoneRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneRepository")
            .field("selector", &self.selector)
            .field("options", &self.options)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
