//! ZoneSync Core Library
//!
//! Offline-first persistence and sync for zones: named map regions with
//! colors, per-grid extents, specializations and input/output slots.
//!
//! # Architecture
//!
//! - **SQLite** is the primary store, with versioned schema migrations.
//! - **JSON file** is the fallback when the database cannot be opened, and a
//!   backup mirror of every database write otherwise.
//! - **Sync server** is reconciled periodically, last write wins.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let repository = ZoneRepository::open(&config, Arc::new(SyncClock::system()))?;
//!
//! let mut zone = Zone::new("Smelters");
//! repository.save(&mut zone)?;
//!
//! let zones = repository.load_all()?;
//! ```
//!
//! # Modules
//!
//! - `repository`: Zone persistence façade (main entry point)
//! - `models`: Zone data structures
//! - `storage`: SQLite and JSON backends, migrations
//! - `sync`: Remote client, sync engine and background worker
//! - `executor`: Bounded background task pool
//! - `clock`: Time sources and the server clock offset
//! - `config`: Application configuration

pub mod clock;
pub mod config;
pub mod executor;
pub mod models;
pub mod repository;
pub mod storage;
pub mod sync;

pub use clock::{SyncClock, TimeSource};
pub use config::{Config, SyncSettings};
pub use executor::{Admission, TaskExecutor, TaskHandle, TaskPriority, TaskQueue};
pub use models::{Color, IconData, Rect, Slot, Specialization, Zone};
pub use repository::{BatchReport, RepositoryOptions, SaveOutcome, ZoneRepository};
pub use storage::{StorageError, StorageResult, ZoneStorage};
pub use sync::{HttpSyncClient, SyncEngine, SyncError, SyncEvent};
