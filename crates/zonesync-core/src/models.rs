//! Data models for zonesync
//!
//! A [`Zone`] is a user-defined spatial record: identity, appearance and the
//! structured metadata (extents, specializations, input and output slots)
//! that travels between the local stores and the sync server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// RGBA color of a zone overlay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::new(194, 194, 65, 56)
    }
}

/// Rectangle covered by a zone inside one grid segment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Rect {
    pub begin_x: i32,
    pub begin_y: i32,
    pub end_x: i32,
    pub end_y: i32,
}

impl Rect {
    pub const fn new(begin_x: i32, begin_y: i32, end_x: i32, end_y: i32) -> Self {
        Self {
            begin_x,
            begin_y,
            end_x,
            end_y,
        }
    }
}

/// A specialization entry; order is significant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Specialization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl Specialization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtype: None,
        }
    }

    pub fn with_subtype(name: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtype: Some(subtype.into()),
        }
    }
}

/// Icon metadata attached to a slot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IconData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_image: Option<String>,
}

impl IconData {
    pub fn is_empty(&self) -> bool {
        self.layer.is_none() && self.static_image.is_none()
    }
}

/// A named input or output slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Slot {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Stock threshold; only meaningful for outputs
    #[serde(rename = "th", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i32>,
    #[serde(rename = "icon_data", default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<IconData>,
}

impl Slot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            threshold: None,
            icon: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_threshold(mut self, threshold: i32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_icon(mut self, icon: IconData) -> Self {
        self.icon = Some(icon);
        self
    }
}

/// A zone record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    /// Local identifier, unique within one store and never reused
    pub id: i64,
    /// Global identity shared with the sync server
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub color: Color,
    #[serde(default)]
    pub hide: bool,
    /// Grid segment id to the rectangle covered inside that segment
    #[serde(default)]
    pub extents: BTreeMap<i64, Rect>,
    #[serde(default)]
    pub specializations: Vec<Specialization>,
    #[serde(default)]
    pub inputs: Vec<Slot>,
    #[serde(default)]
    pub outputs: Vec<Slot>,
    /// Epoch milliseconds of the last change, in the server clock frame
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default)]
    pub sync_group: Option<String>,
    /// Advisory: set once the zone has been exchanged with the server
    #[serde(default)]
    pub synced: bool,
    /// Persisted marker of the last successful exchange with the server
    #[serde(default)]
    pub last_synced_at: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

impl Zone {
    /// Create an unsaved zone; storage assigns `id` and `uuid` on first save
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            uuid: None,
            name: name.into(),
            path: String::new(),
            color: Color::default(),
            hide: false,
            extents: BTreeMap::new(),
            specializations: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            last_updated: 0,
            sync_group: None,
            synced: false,
            last_synced_at: None,
            deleted: false,
        }
    }

    /// Generate a uuid if the zone has none yet; returns the uuid
    pub fn ensure_uuid(&mut self) -> &str {
        self.uuid
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .as_str()
    }

    /// Non-empty uuid, if any
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|u| !u.is_empty())
    }

    /// Whether any user-visible field differs from `other`
    ///
    /// Inputs and outputs compare as unordered collections, specializations
    /// keep their order.
    pub fn content_differs(&self, other: &Zone) -> bool {
        self.name != other.name
            || self.path != other.path
            || self.color != other.color
            || self.hide != other.hide
            || self.sync_group != other.sync_group
            || self.extents != other.extents
            || self.specializations != other.specializations
            || !same_slots(&self.inputs, &other.inputs)
            || !same_slots(&self.outputs, &other.outputs)
    }

    /// Copy mutable fields from a newer copy of the same zone
    ///
    /// Collections are only taken when the newer copy carries entries, so an
    /// empty or absent remote list never erases local data.
    pub fn merge_from(&mut self, newer: &Zone) {
        self.name = newer.name.clone();
        self.path = newer.path.clone();
        self.color = newer.color;
        self.hide = newer.hide;
        if newer.sync_group.is_some() {
            self.sync_group = newer.sync_group.clone();
        }
        if !newer.extents.is_empty() {
            self.extents = newer.extents.clone();
        }
        if !newer.specializations.is_empty() {
            self.specializations = newer.specializations.clone();
        }
        if !newer.inputs.is_empty() {
            self.inputs = newer.inputs.clone();
        }
        if !newer.outputs.is_empty() {
            self.outputs = newer.outputs.clone();
        }
        self.last_updated = newer.last_updated;
        self.synced = true;
    }
}

fn same_slots(a: &[Slot], b: &[Slot]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut remaining: Vec<&Slot> = b.iter().collect();
    for slot in a {
        match remaining.iter().position(|s| *s == slot) {
            Some(pos) => {
                remaining.swap_remove(pos);
            }
            None => return false,
        }
    }
    true
}
