//! Push eligibility
//!
//! Rules are checked in order and the first match decides. All timestamps
//! are in the server frame.

use std::fmt;

/// A local edit this young is pushed even if its stamp trails the sync marker
pub const FRESHNESS_WINDOW_MS: i64 = 60_000;

/// A zone synced this recently is left alone
pub const SYNC_THROTTLE_MS: i64 = 5_000;

/// Upper age bound for an edit that is still pushed after the fresh window
pub const LATE_EDIT_WINDOW_MS: i64 = 600_000;

/// Which rule decided a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushRule {
    /// (a) no sync marker for this uuid
    NeverSynced,
    /// (b) edited after the last sync
    ModifiedSinceSync,
    /// (c) stamp trails the marker but the edit is fresh
    FreshEdit,
    /// (d) synced within the throttle window
    RecentlySynced,
    /// (e) stamp trails a stale marker and the edit is still recent
    LateEdit,
    /// (e) nothing to do
    Unchanged,
}

impl PushRule {
    pub fn should_push(self) -> bool {
        matches!(
            self,
            PushRule::NeverSynced
                | PushRule::ModifiedSinceSync
                | PushRule::FreshEdit
                | PushRule::LateEdit
        )
    }

    /// Rule letter
    pub fn label(self) -> &'static str {
        match self {
            PushRule::NeverSynced => "a",
            PushRule::ModifiedSinceSync => "b",
            PushRule::FreshEdit => "c",
            PushRule::RecentlySynced => "d",
            PushRule::LateEdit | PushRule::Unchanged => "e",
        }
    }
}

impl fmt::Display for PushRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PushRule::NeverSynced => "never synced",
            PushRule::ModifiedSinceSync => "modified since last sync",
            PushRule::FreshEdit => "fresh edit",
            PushRule::RecentlySynced => "recently synced",
            PushRule::LateEdit => "late edit",
            PushRule::Unchanged => "unchanged",
        };
        write!(f, "({}) {}", self.label(), text)
    }
}

/// Decide whether a zone stamped `local` needs pushing given its sync marker
///
/// A zone whose stamp equals its marker is what the server already has,
/// so only (a) and (b) can push it.
pub fn decide(local: i64, synced_at: Option<i64>, now: i64) -> PushRule {
    let Some(synced_at) = synced_at else {
        return PushRule::NeverSynced;
    };
    if local > synced_at {
        return PushRule::ModifiedSinceSync;
    }

    let local_age = now - local;
    let marker_age = now - synced_at;
    if local < synced_at && local_age < FRESHNESS_WINDOW_MS {
        return PushRule::FreshEdit;
    }
    if marker_age < SYNC_THROTTLE_MS {
        return PushRule::RecentlySynced;
    }
    if local < synced_at && local_age < LATE_EDIT_WINDOW_MS && marker_age >= FRESHNESS_WINDOW_MS {
        return PushRule::LateEdit;
    }
    PushRule::Unchanged
}
