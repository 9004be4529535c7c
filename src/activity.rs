use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most entries the recent-activity log ever holds.
pub const MAX_RECENT_ACTIVITY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Epoch milliseconds, bumped when needed so ids strictly increase
    /// (they saturate at `i64::MAX`).
    pub id: i64,
    pub action: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, most-recent-first log of user activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    last_id: i64,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries, keeping the newest ones if the
    /// persisted list is longer than the bound.
    pub fn from_entries(entries: Vec<ActivityEntry>) -> Self {
        let entries: VecDeque<ActivityEntry> =
            entries.into_iter().take(MAX_RECENT_ACTIVITY).collect();
        let last_id = entries.iter().map(|e| e.id).max().unwrap_or(0);
        Self { entries, last_id }
    }

    pub fn record(&mut self, action: &str, details: Option<&str>) -> &ActivityEntry {
        let now = Utc::now();
        let id = now.timestamp_millis().max(self.last_id.saturating_add(1));
        self.last_id = id;

        self.entries.push_front(ActivityEntry {
            id,
            action: action.to_string(),
            details: details.map(|d| d.to_string()),
            timestamp: now,
        });
        self.entries.truncate(MAX_RECENT_ACTIVITY);
        &self.entries[0]
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&ActivityEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
