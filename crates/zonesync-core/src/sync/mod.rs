//! Zone sync with a remote server
//!
//! Offline-first and last-write-wins: every zone carries a `last_updated`
//! stamp in the server's clock frame, and the newer stamp decides each
//! conflict. The server is reconciled periodically by a single background
//! worker.
//!
//! ## HTTP API
//!
//! - `GET /health`
//! - `GET /time` → `{server_time, timestamp}`
//! - `POST /zones` upserts one zone keyed by uuid
//! - `GET /zones?zone_sync=<group>[&updated_after=<ISO-8601>]`
//! - `DELETE /zones/<uuid>?zone_sync=<group>`
//!
//! ## Usage
//!
//! ```ignore
//! let client = HttpSyncClient::from_settings(&settings)?;
//! let engine = Arc::new(SyncEngine::new(repository.clone(), client, settings));
//! let handle = spawn_sync_worker(engine, CHECK_INTERVAL);
//! repository.attach_sync(handle.notifier());
//! ```

mod cache;
mod client;
mod engine;
mod error;
mod payload;
mod policy;
mod worker;

pub use cache::SyncCache;
pub use client::{HttpSyncClient, PulledZones, PushAck, RemoteZones, CONNECT_TIMEOUT, MAX_ATTEMPTS, REQUEST_TIMEOUT};
pub use engine::{
    CycleOutcome, CycleReport, PushDecision, SkipReason, SyncEngine, SyncEvent, CLOCK_ESTIMATE_PERIOD,
    HEALTH_CACHE, MIN_ATTEMPT_SPACING,
};
pub use error::{RemoteError, SyncError};
pub use payload::{format_instant, parse_instant, WireSpace, WireZone};
pub use policy::{decide, PushRule, FRESHNESS_WINDOW_MS, LATE_EDIT_WINDOW_MS, SYNC_THROTTLE_MS};
pub use worker::{
    spawn_sync_worker, SyncCommand, SyncHandle, SyncNotifier, SyncState, SyncStatus, CHECK_INTERVAL,
};
