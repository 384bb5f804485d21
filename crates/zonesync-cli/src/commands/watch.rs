//! Watch command: run the background sync worker in the foreground

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use zonesync_core::sync::{spawn_sync_worker, CHECK_INTERVAL};
use zonesync_core::{Config, ZoneRepository};

use crate::output::Output;

use super::sync::build_engine;

/// Sync periodically until Ctrl-C, printing changes as they happen
pub async fn watch(repository: Arc<ZoneRepository>, config: &Config, output: &Output) -> Result<()> {
    let engine = Arc::new(build_engine(repository.clone(), config)?);
    let mut events = engine.take_events();

    let handle = spawn_sync_worker(engine.clone(), CHECK_INTERVAL);
    repository.attach_sync(handle.notifier());
    handle.trigger();

    output.message(&format!(
        "Watching {} (every {}s). Press Ctrl-C to stop.",
        config.sync_url.as_deref().unwrap_or(""),
        engine.settings().interval().as_secs()
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match event {
                Some(event) => output.print_event(&event),
                None => break,
            },
        }
    }

    info!("Stopping sync worker");
    repository.detach_sync();
    handle.shutdown().await;
    Ok(())
}
