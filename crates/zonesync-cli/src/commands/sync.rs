//! Sync command handler

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use zonesync_core::sync::{CycleOutcome, HttpSyncClient, SkipReason, SyncEngine};
use zonesync_core::{Config, ZoneRepository};

use crate::output::Output;

/// Build an engine talking to the configured server
pub fn build_engine(
    repository: Arc<ZoneRepository>,
    config: &Config,
) -> Result<SyncEngine<HttpSyncClient>> {
    let settings = config.sync_settings();
    if !settings.is_configured() {
        bail!(
            "Sync is not configured. Set it up with:\n  \
             zonesync config set sync_url http://your-server:5000\n  \
             zonesync config set sync_group your-group\n  \
             zonesync config set sync_enabled true"
        );
    }
    let client = HttpSyncClient::from_settings(&settings).context("Invalid sync server URL")?;
    Ok(SyncEngine::new(repository, client, settings))
}

/// Run one sync cycle against the remote server
pub async fn sync(repository: Arc<ZoneRepository>, config: &Config, output: &Output) -> Result<()> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             zonesync config set sync_enabled true"
        );
    }
    let engine = build_engine(repository, config)?;

    output.message("Syncing with server...");
    match engine.sync_now().await.context("Sync failed")? {
        CycleOutcome::Completed(report) => output.print_report(&report),
        CycleOutcome::Skipped(SkipReason::Unhealthy) => {
            bail!("Sync server is unreachable: {}", config.sync_url.as_deref().unwrap_or(""))
        }
        CycleOutcome::Skipped(reason) => {
            output.message(&format!("Sync skipped: {:?}", reason));
        }
    }
    Ok(())
}
