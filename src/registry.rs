use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::autosave::{record_key, AutosaveRecord};
use crate::session::SessionStore;
use crate::storage::read_json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveInfo {
    pub timestamp: DateTime<Utc>,
    pub has_data: bool,
    /// Length in bytes of the payload serialized at query time.
    pub approximate_size: usize,
}

/// Status view over every autosave record of the current principal.
#[derive(Clone)]
pub struct AutosaveRegistry {
    session: SessionStore,
}

impl AutosaveRegistry {
    pub fn new(session: SessionStore) -> Self {
        Self { session }
    }

    /// Logical keys saved by the current principal, sorted.
    pub fn list_keys(&self) -> Vec<String> {
        let Some(owner) = self.session.owner_id() else {
            return Vec::new();
        };
        let prefix = record_key(&owner, "");

        let keys = match self.session.store().keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to enumerate saved keys: {}", e);
                return Vec::new();
            }
        };
        let mut logical: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect();
        logical.sort();
        logical
    }

    pub fn get_info(&self, logical_key: &str) -> Option<AutosaveInfo> {
        if logical_key.is_empty() {
            return None;
        }
        let owner = self.session.owner_id()?;
        let record: AutosaveRecord = read_json(self.session.store(), &record_key(&owner, logical_key))?;

        let approximate_size = match serde_json::to_string(&record.data) {
            Ok(json) => json.len(),
            Err(e) => {
                warn!("Failed to measure saved {}: {}", logical_key, e);
                return None;
            }
        };
        Some(AutosaveInfo {
            timestamp: record.timestamp,
            has_data: is_truthy(&record.data),
            approximate_size,
        })
    }

    /// Removes every record of the current principal and nobody else's.
    pub fn clear_all(&self) {
        let Some(owner) = self.session.owner_id() else {
            return;
        };
        let keys = self.list_keys();
        for key in &keys {
            if let Err(e) = self.session.store().remove(&record_key(&owner, key)) {
                error!("Failed to clear saved {}: {}", key, e);
            }
        }
        info!("Cleared {} autosave records for {}", keys.len(), owner);
    }
}

// Empty strings, zero, false and null count as "no data".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
