//! Ephemeral presence (awareness) per document.
//!
//! ```text
//! awareness frame ──► SessionManager::set_presence
//!                           │
//!                           ├──► PresenceTracker::set   (LWW per session)
//!                           │
//!                           └──► BroadcastGroup         (other sessions)
//! ```
//!
//! Presence lives and dies with its session. It never touches the CRDT
//! engine and is never handed to a store.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Typed view of the usual presence blob. The wire carries arbitrary JSON;
/// this is what the bundled client sends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// CSS color string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Caret position (UTF-16 index)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u32>,
    /// Selection as `[anchor, head]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<[u32; 2]>,
}

impl PresenceState {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// One session's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub user_id: String,
    pub state: Value,
    /// Tracker-wide write sequence; higher is newer.
    pub seq: u64,
    pub updated_at: Instant,
}

/// Presence records of one document, keyed by session id.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<Uuid, PresenceEntry>,
    next_seq: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the session's presence. A `null` state clears it.
    /// Returns `false` when nothing changed.
    pub fn set(&mut self, session_id: Uuid, user_id: &str, state: Value) -> bool {
        if state.is_null() {
            return self.remove(&session_id).is_some();
        }
        if let Some(existing) = self.entries.get(&session_id) {
            if existing.state == state {
                return false;
            }
        }
        self.next_seq += 1;
        self.entries.insert(
            session_id,
            PresenceEntry {
                session_id,
                user_id: user_id.to_string(),
                state,
                seq: self.next_seq,
                updated_at: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, session_id: &Uuid) -> Option<PresenceEntry> {
        self.entries.remove(session_id)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceEntry> {
        self.entries.get(session_id)
    }

    /// `user_id -> payload`. A user with several sessions shows the most
    /// recently written one.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut latest: HashMap<&str, &PresenceEntry> = HashMap::new();
        for entry in self.entries.values() {
            latest
                .entry(entry.user_id.as_str())
                .and_modify(|cur| {
                    if entry.seq > cur.seq {
                        *cur = entry;
                    }
                })
                .or_insert(entry);
        }
        latest
            .into_iter()
            .map(|(user, entry)| (user.to_string(), entry.state.clone()))
            .collect()
    }

    /// All entries, oldest write first.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stable, visually distinct RGBA color for a session.
///
/// Hue comes from the id hash; saturation and lightness are fixed so
/// cursors stay vivid.
pub fn color_for_session(id: Uuid) -> [f32; 4] {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
