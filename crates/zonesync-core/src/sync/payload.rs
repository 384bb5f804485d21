//! JSON shapes exchanged with the zone server

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Color, Rect, Slot, Specialization, Zone};

/// One rectangle of a zone on one grid segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSpace {
    pub grid_id: i64,
    pub begin_x: i32,
    pub begin_y: i32,
    pub end_x: i32,
    pub end_y: i32,
}

/// Zone snapshot as the server stores it
///
/// Collections are optional so an absent list stays distinguishable from
/// an empty one; neither erases local data on merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireZone {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide: Option<bool>,
    #[serde(default)]
    pub space: Option<Vec<WireSpace>>,
    #[serde(default)]
    pub spec: Option<Vec<Specialization>>,
    #[serde(rename = "in", default)]
    pub inputs: Option<Vec<Slot>>,
    #[serde(rename = "out", default)]
    pub outputs: Option<Vec<Slot>>,
    pub last_updated: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub zone_sync: Option<String>,
}

impl WireZone {
    /// Push body for a local zone stamped with `last_updated`
    pub fn from_zone(zone: &Zone, uuid: &str, group: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            name: zone.name.clone(),
            path: Some(zone.path.clone()),
            color: Some(zone.color),
            hide: Some(zone.hide),
            space: Some(
                zone.extents
                    .iter()
                    .map(|(grid_id, rect)| WireSpace {
                        grid_id: *grid_id,
                        begin_x: rect.begin_x,
                        begin_y: rect.begin_y,
                        end_x: rect.end_x,
                        end_y: rect.end_y,
                    })
                    .collect(),
            ),
            spec: Some(zone.specializations.clone()),
            inputs: Some(zone.inputs.clone()),
            outputs: Some(zone.outputs.clone()),
            last_updated: format_instant(zone.last_updated),
            deleted: false,
            zone_sync: Some(group.to_string()),
        }
    }

    /// Convert to an unsaved local zone; None if the uuid or timestamp is unusable
    pub fn into_zone(self) -> Option<Zone> {
        if self.uuid.trim().is_empty() || self.name.is_empty() {
            return None;
        }
        let last_updated = parse_instant(&self.last_updated)?;

        let mut zone = Zone::new(self.name);
        zone.uuid = Some(self.uuid);
        zone.path = self.path.unwrap_or_default();
        zone.color = self.color.unwrap_or_default();
        zone.hide = self.hide.unwrap_or(false);
        zone.extents = self
            .space
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.grid_id, Rect::new(s.begin_x, s.begin_y, s.end_x, s.end_y)))
            .collect::<BTreeMap<_, _>>();
        zone.specializations = self.spec.unwrap_or_default();
        zone.inputs = self.inputs.unwrap_or_default();
        zone.outputs = self.outputs.unwrap_or_default();
        zone.last_updated = last_updated;
        zone.sync_group = self.zone_sync.filter(|g| !g.is_empty());
        zone.synced = true;
        zone.deleted = self.deleted;
        Some(zone)
    }
}

/// Response to an upsert
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Present when the server kept its own newer copy
    #[serde(default)]
    pub server_last_updated: Option<String>,
}

/// Response of `GET /time`
#[derive(Debug, Clone, Deserialize)]
pub struct TimeResponse {
    pub server_time: Option<String>,
    /// Seconds since the epoch, fractional
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl TimeResponse {
    /// Server time in epoch milliseconds
    pub fn millis(&self) -> Option<i64> {
        self.server_time
            .as_deref()
            .and_then(parse_instant)
            .or_else(|| self.timestamp.map(|secs| (secs * 1000.0).round() as i64))
    }
}

/// ISO-8601 UTC with millisecond precision
pub fn format_instant(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 instant; values without an offset are taken as UTC
pub fn parse_instant(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}
