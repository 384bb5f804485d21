//! Sync cycle
//!
//! One cycle, in order:
//!
//! 1. Health probe, cached for 30 seconds.
//! 2. Clock offset estimate, on the first cycle and then hourly.
//! 3. Fresh local snapshot; the dedup cache is rebuilt from its sync markers.
//! 4. Pull every non-deleted remote zone of the group. Unknown uuids are
//!    created locally, known ones are reconciled by `last_updated`.
//! 5. Synced zones missing from the pull are removed locally.
//! 6. Fresh local snapshot.
//! 7. Push every zone the push policy selects.
//! 8. Change notifications.
//! 9. Record the cycle as the last success.
//!
//! A failed pull aborts the cycle before anything is removed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cache::SyncCache;
use super::client::RemoteZones;
use super::error::SyncError;
use super::policy::{decide, PushRule};
use crate::clock::SyncClock;
use crate::config::SyncSettings;
use crate::models::Zone;
use crate::repository::ZoneRepository;

pub const HEALTH_CACHE: Duration = Duration::from_secs(30);
pub const CLOCK_ESTIMATE_PERIOD: Duration = Duration::from_secs(3600);
/// Minimum spacing between two cycle attempts
pub const MIN_ATTEMPT_SPACING: Duration = Duration::from_secs(5);

/// Change notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ZoneAdded(i64),
    ZoneUpdated(i64),
    ZoneRemoved(i64),
    CycleCompleted(CycleReport),
    CycleFailed(String),
}

/// A push decision for one zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDecision {
    pub id: i64,
    pub rule: PushRule,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub merged: usize,
    pub removed: usize,
    pub pushed: usize,
    pub skipped: usize,
    pub push_failures: usize,
    /// Local storage writes performed by the cycle
    pub local_writes: usize,
    pub decisions: Vec<PushDecision>,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.local_writes == 0 && self.pushed == 0
    }
}

/// Why no cycle ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    InFlight,
    TooSoon,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
}

/// Clears the in-flight flag when the cycle ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reconciles the local store with the zone server
pub struct SyncEngine<R> {
    repository: Arc<ZoneRepository>,
    remote: R,
    clock: Arc<SyncClock>,
    settings: Mutex<SyncSettings>,
    cache: Mutex<SyncCache>,
    in_flight: AtomicBool,
    /// Local millis of the last attempt / success, 0 for never
    last_attempt: AtomicI64,
    last_success: AtomicI64,
    /// (checked at, healthy)
    health: Mutex<Option<(i64, bool)>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
}

impl<R: RemoteZones> SyncEngine<R> {
    pub fn new(repository: Arc<ZoneRepository>, remote: R, settings: SyncSettings) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let clock = repository.clock().clone();
        Self {
            repository,
            remote,
            clock,
            settings: Mutex::new(settings),
            cache: Mutex::new(SyncCache::new()),
            in_flight: AtomicBool::new(false),
            last_attempt: AtomicI64::new(0),
            last_success: AtomicI64::new(0),
            health: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        lock(&self.settings).clone()
    }

    pub fn update_settings(&self, settings: SyncSettings) {
        *lock(&self.settings) = settings;
        *lock(&self.health) = None;
    }

    pub fn repository(&self) -> &Arc<ZoneRepository> {
        &self.repository
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        lock(&self.event_rx).take()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Local time of the last completed cycle
    pub fn last_success(&self) -> Option<i64> {
        Some(self.last_success.load(Ordering::SeqCst)).filter(|at| *at != 0)
    }

    /// Run a cycle if sync is active and the spacing and interval allow it
    pub async fn maybe_sync(&self) -> Result<CycleOutcome, SyncError> {
        let settings = self.settings();
        if !settings.is_active() {
            return Ok(CycleOutcome::Skipped(SkipReason::Disabled));
        }
        let now = self.clock.local_now();
        let since = |at: i64| (at != 0).then(|| now - at);
        if since(self.last_attempt.load(Ordering::SeqCst))
            .is_some_and(|elapsed| elapsed < MIN_ATTEMPT_SPACING.as_millis() as i64)
        {
            return Ok(CycleOutcome::Skipped(SkipReason::TooSoon));
        }
        if since(self.last_success.load(Ordering::SeqCst))
            .is_some_and(|elapsed| elapsed < settings.interval().as_millis() as i64)
        {
            return Ok(CycleOutcome::Skipped(SkipReason::TooSoon));
        }
        self.run(settings).await
    }

    /// Run a cycle now, ignoring spacing and interval
    pub async fn sync_now(&self) -> Result<CycleOutcome, SyncError> {
        let settings = self.settings();
        if !settings.is_active() {
            return Err(SyncError::Disabled);
        }
        self.run(settings).await
    }

    /// Soft-delete a zone on the server
    pub async fn delete_remote(&self, uuid: &str, group: Option<String>) -> Result<(), SyncError> {
        let settings = self.settings();
        if !settings.is_active() {
            debug!("Sync inactive; not deleting {} remotely", uuid);
            return Ok(());
        }
        let group = group
            .or_else(|| settings.group().map(str::to_string))
            .ok_or(SyncError::Disabled)?;
        self.remote.delete(uuid, &group).await?;
        lock(&self.cache).remove(uuid);
        info!("Deleted zone {} on server", uuid);
        Ok(())
    }

    async fn run(&self, settings: SyncSettings) -> Result<CycleOutcome, SyncError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Sync cycle already in flight");
            return Ok(CycleOutcome::Skipped(SkipReason::InFlight));
        };
        let Some(group) = settings.group().map(str::to_string) else {
            return Ok(CycleOutcome::Skipped(SkipReason::Disabled));
        };
        self.last_attempt
            .store(self.clock.local_now().max(1), Ordering::SeqCst);

        match self.cycle(&group).await {
            Ok(Some(report)) => {
                self.last_success
                    .store(self.clock.local_now().max(1), Ordering::SeqCst);
                info!(
                    "Sync cycle done: {} created, {} merged, {} removed, {} pushed, {} push failures",
                    report.created, report.merged, report.removed, report.pushed, report.push_failures
                );
                self.emit(SyncEvent::CycleCompleted(report.clone()));
                Ok(CycleOutcome::Completed(report))
            }
            Ok(None) => Ok(CycleOutcome::Skipped(SkipReason::Unhealthy)),
            Err(e) => {
                warn!("Sync cycle failed: {}", e);
                self.emit(SyncEvent::CycleFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// The cycle proper; None when the server is unhealthy
    async fn cycle(&self, group: &str) -> Result<Option<CycleReport>, SyncError> {
        if !self.healthy().await {
            debug!("Sync server unhealthy, skipping cycle");
            return Ok(None);
        }
        self.estimate_clock().await;

        let mut report = CycleReport::default();
        let local = self.repository.snapshot()?;
        lock(&self.cache).rebuild(&local);

        let pulled = self.remote.pull(group, None).await?;
        let mut seen = self.reconcile(group, &local, pulled.zones, &mut report).await?;
        // Listed but undecodable zones still exist on the server
        seen.extend(pulled.unreadable);
        self.remove_missing(group, &local, &seen, &mut report)?;

        let local = self.repository.snapshot()?;
        self.push_eligible(group, &local, &mut report).await;
        Ok(Some(report))
    }

    /// Create or reconcile every pulled zone; returns the uuids seen
    async fn reconcile(
        &self,
        group: &str,
        local: &BTreeMap<i64, Zone>,
        remote: Vec<Zone>,
        report: &mut CycleReport,
    ) -> Result<HashSet<String>, SyncError> {
        let mut by_uuid: HashMap<&str, &Zone> = HashMap::new();
        for zone in local.values() {
            if let Some(uuid) = zone.uuid() {
                by_uuid.entry(uuid).or_insert(zone);
            }
        }

        let mut seen = HashSet::new();
        for mut incoming in remote {
            let Some(uuid) = incoming.uuid().map(str::to_string) else {
                continue;
            };
            if incoming.sync_group.as_deref().is_some_and(|g| g != group) {
                debug!("Ignoring remote zone {} from group {:?}", uuid, incoming.sync_group);
                continue;
            }
            seen.insert(uuid.clone());

            let Some(existing) = by_uuid.get(uuid.as_str()).copied() else {
                incoming.id = 0;
                incoming.sync_group = Some(group.to_string());
                incoming.deleted = false;
                self.repository.apply_remote(&mut incoming)?;
                lock(&self.cache).record(&uuid, incoming.id, incoming.last_updated);
                report.created += 1;
                report.local_writes += 1;
                debug!("Created zone {} from remote {}", incoming.id, uuid);
                self.emit(SyncEvent::ZoneAdded(incoming.id));
                continue;
            };

            let cached_id = lock(&self.cache).local_id(&uuid);
            if cached_id.is_some_and(|id| id != existing.id) {
                warn!(
                    "Remote zone {} maps to local {:?} but matched {}; skipping",
                    uuid, cached_id, existing.id
                );
                report.skipped += 1;
                continue;
            }
            if existing.sync_group.as_deref().is_some_and(|g| g != group) {
                continue;
            }

            if incoming.last_updated > existing.last_updated {
                let mut merged = existing.clone();
                merged.merge_from(&incoming);
                self.repository.apply_remote(&mut merged)?;
                lock(&self.cache).record(&uuid, merged.id, merged.last_updated);
                report.merged += 1;
                report.local_writes += 1;
                debug!("Merged remote changes into zone {}", merged.id);
                self.emit(SyncEvent::ZoneUpdated(merged.id));
            } else if incoming.last_updated < existing.last_updated {
                debug!("Zone {} is newer locally, pushing", existing.id);
                let rule = match lock(&self.cache).synced_at(&uuid) {
                    None => PushRule::NeverSynced,
                    Some(_) => PushRule::ModifiedSinceSync,
                };
                self.push_zone(group, existing, rule, report).await;
            } else if existing.last_synced_at.is_none() {
                // Same stamp on both sides but never marked
                let mut marked = existing.clone();
                self.repository.record_sync(&mut marked)?;
                lock(&self.cache).record(&uuid, marked.id, marked.last_updated);
                report.local_writes += 1;
            }
        }
        Ok(seen)
    }

    /// Remove synced zones the server no longer has
    fn remove_missing(
        &self,
        group: &str,
        local: &BTreeMap<i64, Zone>,
        seen: &HashSet<String>,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        for zone in local.values() {
            let Some(uuid) = zone.uuid() else {
                continue;
            };
            if seen.contains(uuid) || zone.sync_group.as_deref().is_some_and(|g| g != group) {
                continue;
            }
            if !lock(&self.cache).contains(uuid) {
                continue;
            }

            if self.repository.remove_synced(zone.id)?.is_some() {
                report.removed += 1;
                report.local_writes += 1;
                info!("Zone {} ({}) was deleted remotely", zone.id, zone.name);
                self.emit(SyncEvent::ZoneRemoved(zone.id));
            }
            lock(&self.cache).remove(uuid);
        }
        Ok(())
    }

    async fn push_eligible(
        &self,
        group: &str,
        local: &BTreeMap<i64, Zone>,
        report: &mut CycleReport,
    ) {
        for zone in local.values() {
            let Some(uuid) = zone.uuid() else {
                continue;
            };
            if zone.sync_group.as_deref().is_some_and(|g| g != group) {
                continue;
            }
            if report.decisions.iter().any(|d| d.id == zone.id) {
                continue;
            }

            let synced_at = lock(&self.cache).synced_at(uuid);
            let rule = decide(zone.last_updated, synced_at, self.clock.now());
            if !rule.should_push() {
                debug!("Not pushing zone {}: {}", zone.id, rule);
                report.decisions.push(PushDecision { id: zone.id, rule });
                report.skipped += 1;
                continue;
            }
            self.push_zone(group, zone, rule, report).await;
        }
    }

    async fn push_zone(&self, group: &str, zone: &Zone, rule: PushRule, report: &mut CycleReport) {
        report.decisions.push(PushDecision { id: zone.id, rule });
        let Some(uuid) = zone.uuid().map(str::to_string) else {
            return;
        };

        let ack = match self.remote.push(zone, group).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Failed to push zone {} ({}): {}", zone.id, uuid, e);
                report.push_failures += 1;
                return;
            }
        };
        let received_at = self.clock.local_now();

        let canonical = ack.canonical_last_updated.unwrap_or(zone.last_updated);
        if !ack.accepted && canonical != zone.last_updated {
            debug!(
                "Server kept its own copy of zone {} ({} vs local {})",
                zone.id, canonical, zone.last_updated
            );
            report.skipped += 1;
            return;
        }
        if ack.accepted && canonical < zone.last_updated {
            // Server clamped a stamp from our future to its own now
            let offset = self.clock.refine(canonical, received_at);
            debug!("Clock offset refined to {} ms", offset);
        }

        let mut synced = zone.clone();
        synced.last_updated = canonical;
        if let Err(e) = self.repository.record_sync(&mut synced) {
            warn!("Pushed zone {} but could not record sync: {}", zone.id, e);
            report.push_failures += 1;
            return;
        }
        lock(&self.cache).record(&uuid, synced.id, synced.last_updated);
        report.local_writes += 1;
        if ack.accepted {
            report.pushed += 1;
            info!("Pushed zone {} ({}): {}", zone.id, zone.name, rule);
        }
    }

    async fn healthy(&self) -> bool {
        let now = self.clock.local_now();
        let cached = *lock(&self.health);
        if let Some((checked_at, healthy)) = cached {
            if now - checked_at < HEALTH_CACHE.as_millis() as i64 {
                return healthy;
            }
        }
        let healthy = self.remote.health().await;
        *lock(&self.health) = Some((now, healthy));
        healthy
    }

    async fn estimate_clock(&self) {
        if !self.clock.estimate_due(CLOCK_ESTIMATE_PERIOD.as_millis() as i64) {
            return;
        }
        let sent_at = self.clock.local_now();
        match self.remote.server_time().await {
            Ok(server_time) => {
                let received_at = self.clock.local_now();
                let offset = self.clock.record_estimate(server_time, sent_at, received_at);
                info!("Clock offset to sync server: {} ms", offset);
            }
            Err(e) => warn!("Could not estimate clock offset: {}", e),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, TimeSource};
    use crate::config::Config;
    use crate::models::Slot;
    use crate::repository::RepositoryOptions;
    use crate::sync::client::{PulledZones, PushAck};
    use crate::sync::error::RemoteError;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    pub(crate) const GROUP: &str = "world-1";

    /// In-memory stand-in for the zone server
    #[derive(Debug)]
    pub(crate) struct FakeRemote {
        time: Arc<ManualTimeSource>,
        /// Server clock minus local clock
        skew: i64,
        /// Added to accepted stamps
        canonical_shift: AtomicI64,
        zones: Mutex<HashMap<String, Zone>>,
        healthy: AtomicBool,
        fail_pull: AtomicBool,
        /// Uuids listed by the next pulls without a usable body
        unreadable: Mutex<Vec<String>>,
        pub(crate) pushes: AtomicUsize,
        pub(crate) health_checks: AtomicUsize,
        pub(crate) deletes: Mutex<Vec<(String, String)>>,
    }

    impl FakeRemote {
        pub(crate) fn new(time: Arc<ManualTimeSource>, skew: i64) -> Self {
            Self {
                time,
                skew,
                canonical_shift: AtomicI64::new(0),
                zones: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                fail_pull: AtomicBool::new(false),
                unreadable: Mutex::new(Vec::new()),
                pushes: AtomicUsize::new(0),
                health_checks: AtomicUsize::new(0),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn server_now(&self) -> i64 {
            self.time.now_millis() + self.skew
        }

        pub(crate) fn put(&self, zone: Zone) {
            let uuid = zone.uuid().unwrap().to_string();
            self.zones.lock().unwrap().insert(uuid, zone);
        }

        pub(crate) fn get(&self, uuid: &str) -> Option<Zone> {
            self.zones.lock().unwrap().get(uuid).cloned()
        }

        fn remove(&self, uuid: &str) {
            self.zones.lock().unwrap().remove(uuid);
        }
    }

    impl RemoteZones for FakeRemote {
        async fn health(&self) -> bool {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        async fn server_time(&self) -> Result<i64, RemoteError> {
            Ok(self.server_now())
        }

        async fn push(&self, zone: &Zone, group: &str) -> Result<PushAck, RemoteError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            let uuid = zone.uuid().unwrap().to_string();
            let mut zones = self.zones.lock().unwrap();
            if let Some(existing) = zones.get(&uuid) {
                if zone.last_updated <= existing.last_updated {
                    return Ok(PushAck {
                        accepted: false,
                        canonical_last_updated: Some(existing.last_updated),
                    });
                }
            }
            let mut stored = zone.clone();
            stored.id = 0;
            stored.last_updated = zone.last_updated.min(self.server_now())
                + self.canonical_shift.load(Ordering::SeqCst);
            stored.sync_group = Some(group.to_string());
            stored.last_synced_at = None;
            let canonical = stored.last_updated;
            zones.insert(uuid, stored);
            Ok(PushAck {
                accepted: true,
                canonical_last_updated: Some(canonical),
            })
        }

        async fn pull(&self, group: &str, _updated_after: Option<i64>) -> Result<PulledZones, RemoteError> {
            if self.fail_pull.load(Ordering::SeqCst) {
                return Err(RemoteError::Status { status: 503 });
            }
            let unreadable = self.unreadable.lock().unwrap().clone();
            let zones = self
                .zones
                .lock()
                .unwrap()
                .values()
                .filter(|z| z.sync_group.as_deref() == Some(group) && !z.deleted)
                .filter(|z| !unreadable.iter().any(|u| z.uuid() == Some(u.as_str())))
                .cloned()
                .collect();
            Ok(PulledZones { zones, unreadable })
        }

        async fn delete(&self, uuid: &str, group: &str) -> Result<(), RemoteError> {
            self.deletes
                .lock()
                .unwrap()
                .push((uuid.to_string(), group.to_string()));
            self.remove(uuid);
            Ok(())
        }
    }

    pub(crate) struct Harness {
        _temp_dir: TempDir,
        pub(crate) time: Arc<ManualTimeSource>,
        pub(crate) repository: Arc<ZoneRepository>,
        pub(crate) engine: Arc<SyncEngine<FakeRemote>>,
    }

    impl Harness {
        pub(crate) fn remote(&self) -> &FakeRemote {
            &self.engine.remote
        }

        pub(crate) fn save(&self, zone: &mut Zone) {
            assert!(self.repository.save(zone).unwrap().is_saved());
        }

        async fn cycle(&self) -> CycleReport {
            match self.engine.sync_now().await.unwrap() {
                CycleOutcome::Completed(report) => report,
                other => panic!("cycle did not run: {:?}", other),
            }
        }
    }

    pub(crate) fn harness_with_skew(skew: i64) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::with_data_dir(temp_dir.path());
        config.sync_enabled = true;
        config.sync_url = Some("http://zones.test".to_string());
        config.sync_group = Some(GROUP.to_string());

        let time = Arc::new(ManualTimeSource::new(1_000));
        let clock = Arc::new(SyncClock::new(time.clone()));
        let options = RepositoryOptions {
            save_throttle: Duration::ZERO,
            load_grace: Duration::ZERO,
            mirror: false,
        };
        let repository = Arc::new(ZoneRepository::open_with(&config, clock, options).unwrap());
        let remote = FakeRemote::new(time.clone(), skew);
        let engine = Arc::new(SyncEngine::new(
            repository.clone(),
            remote,
            config.sync_settings(),
        ));
        Harness {
            _temp_dir: temp_dir,
            time,
            repository,
            engine,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with_skew(0)
    }

    fn remote_zone(uuid: &str, name: &str, last_updated: i64) -> Zone {
        let mut zone = Zone::new(name);
        zone.uuid = Some(uuid.to_string());
        zone.sync_group = Some(GROUP.to_string());
        zone.last_updated = last_updated;
        zone
    }

    #[tokio::test]
    async fn test_first_push_then_idempotent_cycle() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);

        let report = h.cycle().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(
            report.decisions,
            vec![PushDecision { id: zone.id, rule: PushRule::NeverSynced }]
        );
        let after_first = h.repository.snapshot().unwrap();
        assert_eq!(after_first[&zone.id].last_synced_at, Some(zone.last_updated));

        h.time.advance(10_000);
        let report = h.cycle().await;
        assert!(report.is_noop(), "{:?}", report);
        assert_eq!(h.repository.snapshot().unwrap(), after_first);
        assert_eq!(h.remote().pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canonical_stamp_adopted_and_not_repushed() {
        let h = harness();
        h.remote().canonical_shift.store(5, Ordering::SeqCst);
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        assert_eq!(zone.last_updated, 1_000);

        h.cycle().await;
        let stored = h.repository.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(stored.last_updated, 1_005);
        assert_eq!(stored.last_synced_at, Some(1_005));

        h.time.set(1_010);
        let report = h.cycle().await;
        assert_eq!(
            report.decisions,
            vec![PushDecision { id: zone.id, rule: PushRule::RecentlySynced }]
        );
        assert_eq!(report.local_writes, 0);
        assert_eq!(h.remote().pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pull_creates_zone_with_next_id() {
        let h = harness();
        let mut gone = Zone::new("Gone");
        h.save(&mut gone);
        h.repository.delete(gone.id).unwrap();

        let mut incoming = remote_zone("r-1", "Remote farm", 900);
        incoming.outputs.push(Slot::new("Wheat"));
        h.remote().put(incoming);
        let mut events = h.engine.take_events().unwrap();

        let report = h.cycle().await;
        assert_eq!(report.created, 1);

        let zones = h.repository.snapshot().unwrap();
        let created = zones.values().find(|z| z.uuid() == Some("r-1")).unwrap();
        assert_eq!(created.id, gone.id + 1);
        assert_eq!(created.last_updated, 900);
        assert_eq!(created.last_synced_at, Some(900));
        assert_eq!(created.outputs[0].name, "Wheat");
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ZoneAdded(created.id));
        // Pulled zone is not pushed straight back
        assert_eq!(h.remote().pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_newer_merges_sparsely() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        zone.inputs.push(Slot::new("Ore"));
        h.save(&mut zone);
        h.cycle().await;

        let mut update = h.remote().get(zone.uuid().unwrap()).unwrap();
        update.name = "Deep mine".to_string();
        update.inputs.clear();
        update.last_updated = 5_000;
        h.remote().put(update);

        h.time.set(6_000);
        let report = h.cycle().await;
        assert_eq!(report.merged, 1);
        let merged = h.repository.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(merged.name, "Deep mine");
        assert_eq!(merged.inputs, zone.inputs);
        assert_eq!(merged.last_updated, 5_000);
        assert_eq!(merged.last_synced_at, Some(5_000));
    }

    #[tokio::test]
    async fn test_local_newer_pushes_once() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        h.cycle().await;

        h.time.set(20_000);
        zone.name = "Renamed".to_string();
        h.save(&mut zone);

        let report = h.cycle().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(
            report.decisions,
            vec![PushDecision { id: zone.id, rule: PushRule::ModifiedSinceSync }]
        );
        assert_eq!(h.remote().pushes.load(Ordering::SeqCst), 2);
        assert_eq!(h.remote().get(zone.uuid().unwrap()).unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn test_conflict_resolution_is_deterministic() {
        // Both sides edited; the later stamp wins no matter who syncs
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        h.cycle().await;
        let uuid = zone.uuid().unwrap().to_string();

        h.time.set(30_000);
        zone.name = "Local edit".to_string();
        h.save(&mut zone);
        let mut remote = h.remote().get(&uuid).unwrap();
        remote.name = "Remote edit".to_string();
        remote.last_updated = 40_000;
        h.remote().put(remote);

        h.time.set(41_000);
        h.cycle().await;
        assert_eq!(h.repository.get_by_id(zone.id).unwrap().unwrap().name, "Remote edit");
        assert_eq!(h.remote().get(&uuid).unwrap().name, "Remote edit");
    }

    #[tokio::test]
    async fn test_remote_deletion_removes_synced_zones_only() {
        let h = harness();
        let mut synced = Zone::new("Synced");
        h.save(&mut synced);
        h.cycle().await;

        h.remote().remove(synced.uuid().unwrap());
        h.time.set(20_000);
        let mut fresh = Zone::new("Never synced");
        h.save(&mut fresh);
        let mut events = h.engine.take_events().unwrap();
        // Drop the first cycle's events
        while events.try_recv().is_ok() {}

        let report = h.cycle().await;
        assert_eq!(report.removed, 1);
        let zones = h.repository.snapshot().unwrap();
        assert!(!zones.contains_key(&synced.id));
        assert!(zones.contains_key(&fresh.id));
        assert!(h.remote().get(fresh.uuid().unwrap()).is_some());
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ZoneRemoved(synced.id));
    }

    #[tokio::test]
    async fn test_unmarked_local_newer_zone_is_attributed_to_first_push() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        h.remote().put(remote_zone(zone.uuid().unwrap(), "Older", 500));

        let report = h.cycle().await;
        assert_eq!(
            report.decisions,
            vec![PushDecision { id: zone.id, rule: PushRule::NeverSynced }]
        );
        assert_eq!(report.pushed, 1);
        assert_eq!(h.remote().get(zone.uuid().unwrap()).unwrap().name, "Mine");
    }

    #[tokio::test]
    async fn test_unreadable_remote_entry_keeps_local_zone() {
        let h = harness();
        let mut zone = Zone::new("Synced mine");
        h.save(&mut zone);
        h.cycle().await;

        // Server still lists the zone, but with a body that does not decode
        let uuid = zone.uuid().unwrap().to_string();
        h.remote().unreadable.lock().unwrap().push(uuid);
        h.time.set(20_000);
        let report = h.cycle().await;

        assert_eq!(report.removed, 0);
        assert_eq!(report.local_writes, 0);
        let stored = h.repository.get_by_id(zone.id).unwrap().unwrap();
        assert_eq!(stored.last_synced_at, Some(zone.last_updated));
    }

    #[tokio::test]
    async fn test_failed_pull_removes_nothing() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        h.cycle().await;

        h.remote().fail_pull.store(true, Ordering::SeqCst);
        h.time.set(20_000);
        assert!(matches!(h.engine.sync_now().await, Err(SyncError::Remote(_))));
        assert!(h.repository.get_by_id(zone.id).unwrap().is_some());
        assert!(!h.engine.is_in_flight());
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_not_merged() {
        let h = harness();
        let mut first = Zone::new("First");
        h.save(&mut first);
        let mut copy = Zone::new("Copy");
        copy.uuid = first.uuid.clone();
        h.save(&mut copy);
        // Only the copy carries a sync marker, so the cache points at it
        h.repository.record_sync(&mut copy).unwrap();

        let uuid = first.uuid().unwrap();
        h.remote().put(remote_zone(uuid, "Remote", 60_000));
        h.time.set(61_000);

        let report = h.cycle().await;
        assert_eq!(report.merged, 0);
        assert_eq!(report.created, 0);
        let zones = h.repository.snapshot().unwrap();
        assert_eq!(zones[&first.id].name, "First");
        assert_eq!(zones[&copy.id].name, "Copy");
    }

    #[tokio::test]
    async fn test_unhealthy_server_skips_and_is_cached() {
        let h = harness();
        h.remote().healthy.store(false, Ordering::SeqCst);
        assert_eq!(
            h.engine.sync_now().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::Unhealthy)
        );

        h.remote().healthy.store(true, Ordering::SeqCst);
        h.time.advance(10_000);
        assert_eq!(
            h.engine.sync_now().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::Unhealthy)
        );
        assert_eq!(h.remote().health_checks.load(Ordering::SeqCst), 1);

        h.time.advance(25_000);
        assert!(matches!(
            h.engine.sync_now().await.unwrap(),
            CycleOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_clock_offset_estimated_and_used_for_stamps() {
        let h = harness_with_skew(100_000);
        h.cycle().await;
        assert_eq!(h.repository.clock().offset(), 100_000);

        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        assert_eq!(zone.last_updated, h.time.now_millis() + 100_000);

        let report = h.cycle().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(
            h.remote().get(zone.uuid().unwrap()).unwrap().last_updated,
            zone.last_updated
        );
    }

    #[tokio::test]
    async fn test_trigger_gate() {
        let h = harness();
        assert!(matches!(h.engine.maybe_sync().await.unwrap(), CycleOutcome::Completed(_)));

        h.time.advance(1_000);
        assert_eq!(
            h.engine.maybe_sync().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::TooSoon)
        );

        // Past the attempt spacing but inside the 300s interval
        h.time.advance(10_000);
        assert_eq!(
            h.engine.maybe_sync().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::TooSoon)
        );

        h.time.advance(300_000);
        assert!(matches!(h.engine.maybe_sync().await.unwrap(), CycleOutcome::Completed(_)));

        let mut settings = h.engine.settings();
        settings.enabled = false;
        h.engine.update_settings(settings);
        assert_eq!(
            h.engine.maybe_sync().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::Disabled)
        );
        assert!(matches!(h.engine.sync_now().await, Err(SyncError::Disabled)));
    }

    #[tokio::test]
    async fn test_delete_remote() {
        let h = harness();
        let mut zone = Zone::new("Mine");
        h.save(&mut zone);
        h.cycle().await;
        let uuid = zone.uuid().unwrap().to_string();

        h.engine.delete_remote(&uuid, None).await.unwrap();
        assert_eq!(
            h.remote().deletes.lock().unwrap().as_slice(),
            &[(uuid.clone(), GROUP.to_string())]
        );
        assert!(h.remote().get(&uuid).is_none());
    }
}
