//! Zone command handlers

use std::sync::Arc;

use anyhow::{Context, Result};

use zonesync_core::{Config, TaskExecutor, Zone, ZoneRepository};

use crate::output::Output;

use super::sync::build_engine;

/// List live zones, ordered by id
pub async fn list(
    repository: &Arc<ZoneRepository>,
    executor: &TaskExecutor,
    include_hidden: bool,
    output: &Output,
) -> Result<()> {
    let zones = load_visible(repository, executor, include_hidden).await?;
    output.print_zones(&zones);
    Ok(())
}

/// Load zones on the task pool at read priority
async fn load_visible(
    repository: &Arc<ZoneRepository>,
    executor: &TaskExecutor,
    include_hidden: bool,
) -> Result<Vec<Zone>> {
    let handle = repository
        .submit_load_all(executor)
        .context("Task queue is full, try again")?;
    let zones = handle
        .join()
        .await
        .context("Zone load was abandoned")?
        .context("Failed to load zones")?
        .into_values()
        .filter(|zone| !zone.deleted && (include_hidden || !zone.hide))
        .collect();
    Ok(zones)
}

/// Show a single zone
pub fn show(repository: &ZoneRepository, id: i64, output: &Output) -> Result<()> {
    let zone = find_live(repository, id)?;
    output.print_zone(&zone);
    Ok(())
}

/// Delete a zone locally, then on the server when sync is active
pub async fn delete(
    repository: Arc<ZoneRepository>,
    config: &Config,
    id: i64,
    output: &Output,
) -> Result<()> {
    let zone = find_live(&repository, id)?;
    repository
        .delete(id)
        .with_context(|| format!("Failed to delete zone {}", id))?;
    output.success(&format!("Deleted zone {} ({})", id, zone.name));

    let settings = config.sync_settings();
    let Some(uuid) = zone.uuid() else {
        return Ok(());
    };
    if !settings.is_active() {
        output.message("Sync is not active; the server copy is left untouched.");
        return Ok(());
    }

    let engine = build_engine(repository.clone(), config)?;
    match engine.delete_remote(uuid, zone.sync_group.clone()).await {
        Ok(()) => output.message("Deleted on sync server."),
        Err(e) => eprintln!("⚠ Server delete failed: {}", e),
    }
    Ok(())
}

/// Copy zones from the JSON fallback file into an empty database
pub fn import(repository: &ZoneRepository, output: &Output) -> Result<()> {
    let imported = repository.migrate_from_document()?;
    if imported == 0 {
        output.message("Nothing to import.");
    } else {
        output.success(&format!("Imported {} zone(s) from JSON", imported));
    }
    Ok(())
}

fn find_live(repository: &ZoneRepository, id: i64) -> Result<Zone> {
    repository
        .get_by_id(id)
        .with_context(|| format!("Failed to load zone {}", id))?
        .filter(|zone| !zone.deleted)
        .ok_or_else(|| anyhow::anyhow!("Zone not found: {}", id))
}
