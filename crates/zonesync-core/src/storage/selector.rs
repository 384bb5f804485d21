//! Backend selection
//!
//! The database is probed on first use. If it cannot be opened (including a
//! failed migration) the JSON document backend serves every request for the
//! rest of the process, unless [`StorageSelector::reset`] forces a re-probe.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::document::DocumentStore;
use super::relational::RelationalStore;
use super::{StoreContext, ZoneStorage};
use crate::config::Config;

#[derive(Debug)]
enum Selection {
    Database(Arc<RelationalStore>),
    Document,
}

/// Chooses between the database and the JSON fallback
#[derive(Debug)]
pub struct StorageSelector {
    config: Config,
    context: StoreContext,
    fallback: Arc<DocumentStore>,
    selection: Mutex<Option<Selection>>,
}

impl StorageSelector {
    pub fn new(config: Config, context: StoreContext) -> Self {
        let fallback = Arc::new(DocumentStore::new(config.document_path(), context.clone()));
        Self {
            config,
            context,
            fallback,
            selection: Mutex::new(None),
        }
    }

    /// The backend serving requests, probing the database on first use
    pub fn active(&self) -> Arc<dyn ZoneStorage> {
        match self.primary() {
            Some(primary) => primary as Arc<dyn ZoneStorage>,
            None => self.fallback.clone(),
        }
    }

    /// The database backend, if it is the active one
    pub fn primary(&self) -> Option<Arc<RelationalStore>> {
        let mut selection = self.lock();
        match selection.get_or_insert_with(|| self.probe()) {
            Selection::Database(store) => Some(store.clone()),
            Selection::Document => None,
        }
    }

    /// The JSON document backend (fallback and backup mirror)
    pub fn fallback(&self) -> &Arc<DocumentStore> {
        &self.fallback
    }

    pub fn is_using_database(&self) -> bool {
        self.primary().is_some()
    }

    /// Forget the current choice; the next use probes again
    pub fn reset(&self) {
        if let Some(Selection::Database(store)) = self.lock().take() {
            store.shutdown();
        }
        info!("Storage selection reset");
    }

    /// Close the database connection, if one is open
    pub fn shutdown(&self) {
        if let Some(Selection::Database(store)) = self.lock().as_ref() {
            store.shutdown();
        }
    }

    fn probe(&self) -> Selection {
        match RelationalStore::open(&self.config, self.context.clone()) {
            Ok(store) if store.is_available() => {
                info!("Using zone database at {:?}", self.config.database_path());
                Selection::Database(Arc::new(store))
            }
            Ok(_) => {
                warn!("Zone database not available, using JSON fallback");
                Selection::Document
            }
            Err(e) => {
                warn!(
                    "Zone database unavailable ({}), using JSON fallback at {:?}",
                    e,
                    self.fallback.path()
                );
                Selection::Document
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Selection>> {
        self.selection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
