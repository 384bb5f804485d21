//! Status command handler

use anyhow::{Context, Result};

use zonesync_core::sync::{HttpSyncClient, RemoteZones};
use zonesync_core::{Config, ZoneRepository};

use crate::output::{format_millis, Output, OutputFormat};

#[derive(Debug, Default, PartialEq, Eq)]
struct ZoneCounts {
    live: usize,
    synced: usize,
    hidden: usize,
    tombstones: usize,
}

/// Show storage and sync status
pub async fn show(repository: &ZoneRepository, config: &Config, output: &Output) -> Result<()> {
    let zones = repository.load_all().context("Failed to load zones")?;
    let mut counts = ZoneCounts::default();
    let mut last_synced = None;
    for zone in zones.values() {
        if zone.deleted {
            counts.tombstones += 1;
            continue;
        }
        counts.live += 1;
        if zone.hide {
            counts.hidden += 1;
        }
        if let Some(at) = zone.last_synced_at {
            counts.synced += 1;
            last_synced = last_synced.max(Some(at));
        }
    }

    let settings = config.sync_settings();
    let reachable = if settings.is_configured() {
        match HttpSyncClient::from_settings(&settings) {
            Ok(client) => Some(client.health().await),
            Err(_) => Some(false),
        }
    } else {
        None
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "backend": repository.backend(),
                    "data_dir": config.data_dir,
                    "sync": {
                        "enabled": settings.enabled,
                        "url": settings.server_url,
                        "group": settings.sync_group,
                        "interval_secs": settings.interval().as_secs(),
                        "reachable": reachable,
                        "last_synced_at": last_synced
                    },
                    "counts": {
                        "zones": counts.live,
                        "synced": counts.synced,
                        "hidden": counts.hidden,
                        "tombstones": counts.tombstones
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", counts.live);
        }
        OutputFormat::Human => {
            println!("ZoneSync Status");
            println!("===============");
            println!();
            println!("Storage:");
            println!("  Backend:  {}", repository.backend());
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Sync:");
            println!(
                "  Status:   {}",
                match (settings.is_active(), settings.enabled) {
                    (true, _) => "enabled",
                    (false, true) => "enabled (not configured)",
                    (false, false) => "disabled",
                }
            );
            if let Some(ref url) = settings.server_url {
                println!("  Server:   {}", url);
            }
            if let Some(ref group) = settings.sync_group {
                println!("  Group:    {}", group);
            }
            println!("  Interval: {}s", settings.interval().as_secs());
            match reachable {
                Some(true) => println!("  Health:   reachable"),
                Some(false) => println!("  Health:   unreachable"),
                None => {}
            }
            println!(
                "  Last:     {}",
                last_synced.map(format_millis).unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("Contents:");
            println!("  Zones:      {}", counts.live);
            println!("  Synced:     {}", counts.synced);
            println!("  Hidden:     {}", counts.hidden);
            println!("  Tombstones: {}", counts.tombstones);
        }
    }

    Ok(())
}
