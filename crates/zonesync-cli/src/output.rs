//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Utc};
use serde::Serialize;

use zonesync_core::sync::{CycleReport, SyncEvent};
use zonesync_core::Zone;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single zone with all of its details
    pub fn print_zone(&self, zone: &Zone) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:           {}", zone.id);
                println!("UUID:         {}", zone.uuid().unwrap_or("(none)"));
                println!("Name:         {}", zone.name);
                if !zone.path.is_empty() {
                    println!("Path:         {}", zone.path);
                }
                let c = zone.color;
                println!("Color:        #{:02x}{:02x}{:02x}{:02x}", c.r, c.g, c.b, c.a);
                if zone.hide {
                    println!("Hidden:       yes");
                }
                if let Some(ref group) = zone.sync_group {
                    println!("Sync group:   {}", group);
                }
                println!("Updated:      {}", format_millis(zone.last_updated));
                println!(
                    "Last synced:  {}",
                    zone.last_synced_at
                        .map(format_millis)
                        .unwrap_or_else(|| "never".to_string())
                );

                if !zone.extents.is_empty() {
                    println!();
                    println!("── Extents ({}) ──", zone.extents.len());
                    for (grid, rect) in &zone.extents {
                        println!(
                            "grid {}: ({}, {}) → ({}, {})",
                            grid, rect.begin_x, rect.begin_y, rect.end_x, rect.end_y
                        );
                    }
                }
                if !zone.specializations.is_empty() {
                    println!();
                    println!("── Specializations ──");
                    for spec in &zone.specializations {
                        match spec.subtype {
                            Some(ref subtype) => println!("{} ({})", spec.name, subtype),
                            None => println!("{}", spec.name),
                        }
                    }
                }
                for (label, slots) in [("Inputs", &zone.inputs), ("Outputs", &zone.outputs)] {
                    if slots.is_empty() {
                        continue;
                    }
                    println!();
                    println!("── {} ({}) ──", label, slots.len());
                    for slot in slots {
                        let mut line = slot.name.clone();
                        if let Some(ref kind) = slot.kind {
                            line.push_str(&format!(" [{}]", kind));
                        }
                        if let Some(threshold) = slot.threshold {
                            line.push_str(&format!(" ≥ {}", threshold));
                        }
                        println!("{}", line);
                    }
                }
            }
            OutputFormat::Json => print_json(zone),
            OutputFormat::Quiet => {
                println!("{}", zone.id);
            }
        }
    }

    /// Print a list of zones
    pub fn print_zones(&self, zones: &[Zone]) {
        match self.format {
            OutputFormat::Human => {
                if zones.is_empty() {
                    println!("No zones found.");
                    return;
                }
                for zone in zones {
                    let sync_indicator = if zone.last_synced_at.is_some() { "✓" } else { " " };
                    println!(
                        "{:>5} {} {} | {} | {}",
                        zone.id,
                        sync_indicator,
                        truncate(&zone.name, 30),
                        truncate(&zone.path, 30),
                        zone.uuid().map(short_uuid).unwrap_or("--------")
                    );
                }
                println!("\n{} zone(s)", zones.len());
            }
            OutputFormat::Json => print_json(&zones),
            OutputFormat::Quiet => {
                for zone in zones {
                    println!("{}", zone.id);
                }
            }
        }
    }

    /// Print what one sync cycle did
    pub fn print_report(&self, report: &CycleReport) {
        match self.format {
            OutputFormat::Human => {
                if report.is_noop() {
                    println!("✓ Sync complete - already up to date");
                    return;
                }
                println!("✓ Sync complete");
                println!(
                    "  Created: {}, Merged: {}, Removed: {}",
                    report.created, report.merged, report.removed
                );
                println!(
                    "  Pushed: {}, Skipped: {}, Failed: {}",
                    report.pushed, report.skipped, report.push_failures
                );
            }
            OutputFormat::Json => {
                let decisions: Vec<_> = report
                    .decisions
                    .iter()
                    .map(|d| serde_json::json!({"id": d.id, "rule": d.rule.label()}))
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "created": report.created,
                        "merged": report.merged,
                        "removed": report.removed,
                        "pushed": report.pushed,
                        "skipped": report.skipped,
                        "push_failures": report.push_failures,
                        "local_writes": report.local_writes,
                        "decisions": decisions
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print one engine event (watch mode)
    pub fn print_event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => match event {
                SyncEvent::ZoneAdded(id) => println!("+ zone {}", id),
                SyncEvent::ZoneUpdated(id) => println!("~ zone {}", id),
                SyncEvent::ZoneRemoved(id) => println!("- zone {}", id),
                SyncEvent::CycleCompleted(report) => {
                    if !report.is_noop() {
                        println!(
                            "[{}] synced: {} pushed, {} created, {} merged, {} removed",
                            Utc::now().format("%H:%M:%S"),
                            report.pushed,
                            report.created,
                            report.merged,
                            report.removed
                        );
                    }
                }
                SyncEvent::CycleFailed(error) => {
                    eprintln!("[{}] sync failed: {}", Utc::now().format("%H:%M:%S"), error)
                }
            },
            OutputFormat::Json => {
                let value = match event {
                    SyncEvent::ZoneAdded(id) => serde_json::json!({"event": "added", "id": id}),
                    SyncEvent::ZoneUpdated(id) => serde_json::json!({"event": "updated", "id": id}),
                    SyncEvent::ZoneRemoved(id) => serde_json::json!({"event": "removed", "id": id}),
                    SyncEvent::CycleCompleted(report) => serde_json::json!({
                        "event": "cycle",
                        "pushed": report.pushed,
                        "created": report.created,
                        "merged": report.merged,
                        "removed": report.removed
                    }),
                    SyncEvent::CycleFailed(error) => {
                        serde_json::json!({"event": "failed", "error": error})
                    }
                };
                println!("{}", value);
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode JSON: {}", e),
    }
}

/// Render epoch millis as a UTC timestamp, or "-" for unset
pub fn format_millis(ms: i64) -> String {
    if ms <= 0 {
        return "-".to_string();
    }
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn short_uuid(uuid: &str) -> &str {
    uuid.get(..8).unwrap_or(uuid)
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
