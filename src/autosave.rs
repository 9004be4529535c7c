//! Debounced autosave of arbitrary serializable state, namespaced per principal.
//!
//! A scheduler owns at most one pending write. Every change notification cancels
//! it and, when the new value differs from the last persisted snapshot, arms a
//! fresh timer. Only the most recent value inside a quiet period is written.
//! Dropping the scheduler flushes whatever is still pending.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_AUTOSAVE_DELAY;
use crate::error::DeskError;
use crate::session::SessionStore;
use crate::storage::read_json;

/// What lands in the store under `{owner}_{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveRecord {
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

pub fn record_key(owner_id: &str, logical_key: &str) -> String {
    format!("{}_{}", owner_id, logical_key)
}

#[derive(Debug, Clone)]
pub struct AutosaveOptions {
    pub delay: Duration,
    pub enabled: bool,
}

impl Default for AutosaveOptions {
    fn default() -> Self {
        Self {
            delay: DEFAULT_AUTOSAVE_DELAY,
            enabled: true,
        }
    }
}

struct PendingWrite {
    generation: u64,
    payload: Value,
    timer: JoinHandle<()>,
}

struct SchedulerState {
    enabled: bool,
    latest: Option<Value>,
    /// Owner the snapshot was written for, and the snapshot itself.
    last_saved: Option<(String, Value)>,
    pending: Option<PendingWrite>,
    generation: u64,
}

struct Shared {
    key: String,
    delay: Duration,
    session: SessionStore,
    runtime: Handle,
    state: Mutex<SchedulerState>,
}

pub struct AutosaveScheduler {
    shared: Arc<Shared>,
}

impl AutosaveScheduler {
    /// Must be called from within a tokio runtime; timers are spawned onto it.
    /// No timer is started until the first change notification.
    pub fn new(
        session: SessionStore,
        key: impl Into<String>,
        options: AutosaveOptions,
    ) -> crate::Result<Self> {
        let runtime = Handle::try_current().map_err(|_| DeskError::MissingRuntime)?;
        Ok(Self {
            shared: Arc::new(Shared {
                key: key.into(),
                delay: options.delay,
                session,
                runtime,
                state: Mutex::new(SchedulerState {
                    enabled: options.enabled,
                    latest: None,
                    last_saved: None,
                    pending: None,
                    generation: 0,
                }),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Enabled and a principal is signed in.
    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled && self.shared.session.is_signed_in()
    }

    pub fn has_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Disabling cancels any pending write; re-enabling re-evaluates the
    /// latest value against the last persisted one.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.lock();
        state.enabled = enabled;
        self.shared.evaluate(&mut state);
    }

    /// Reports a new value of the tracked data.
    pub fn notify_changed<T: Serialize + ?Sized>(&self, data: &T) {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Autosave of {} skipped, value does not serialize: {}", self.shared.key, e);
                return;
            }
        };
        let mut state = self.shared.lock();
        state.latest = Some(value);
        self.shared.evaluate(&mut state);
    }

    /// Cancels any pending write and writes the latest value now.
    pub fn force_save(&self) {
        let mut state = self.shared.lock();
        self.shared.cancel_pending(&mut state);
        if let Some(latest) = state.latest.clone() {
            self.shared.write_locked(&mut state, latest);
        }
    }

    pub fn load_value(&self) -> Option<Value> {
        let owner = {
            let state = self.shared.lock();
            self.shared.active_owner(&state)?
        };
        let record: AutosaveRecord = read_json(
            self.shared.session.store(),
            &record_key(&owner, &self.shared.key),
        )?;
        Some(record.data)
    }

    pub fn load_data<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.load_value()?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Saved {} does not match the requested shape: {}", self.shared.key, e);
                None
            }
        }
    }

    pub fn clear_saved_data(&self) {
        let mut state = self.shared.lock();
        self.shared.cancel_pending(&mut state);
        let Some(owner) = self.shared.active_owner(&state) else {
            return;
        };

        let storage_key = record_key(&owner, &self.shared.key);
        if let Err(e) = self.shared.session.store().remove(&storage_key) {
            error!("Failed to clear saved {}: {}", self.shared.key, e);
            return;
        }
        state.last_saved = None;
        info!("Cleared saved {} for {}", self.shared.key, owner);
        self.shared
            .session
            .add_activity(&format!("Cleared saved {}", self.shared.key), None);
    }

    /// Tears the scheduler down, flushing any pending write first.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(pending) = state.pending.take() {
            pending.timer.abort();
            debug!("Flushing pending autosave of {} on teardown", self.shared.key);
            self.shared.write_locked(&mut state, pending.payload);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Owner to write for, if writes are currently allowed at all.
    fn active_owner(&self, state: &SchedulerState) -> Option<String> {
        if !state.enabled || self.key.is_empty() {
            return None;
        }
        self.session.owner_id()
    }

    fn cancel_pending(&self, state: &mut SchedulerState) {
        if let Some(pending) = state.pending.take() {
            pending.timer.abort();
            debug!("Cancelled pending autosave of {} (generation {})", self.key, pending.generation);
        }
    }

    fn evaluate(self: &Arc<Self>, state: &mut SchedulerState) {
        self.cancel_pending(state);

        let Some(latest) = state.latest.clone() else {
            return;
        };
        if latest.is_null() {
            return;
        }
        let Some(owner) = self.active_owner(state) else {
            return;
        };
        // A snapshot saved for another principal says nothing about this one's namespace
        if matches!(&state.last_saved, Some((saved_owner, saved)) if *saved_owner == owner && *saved == latest) {
            debug!("{} unchanged since last save", self.key);
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let shared = Arc::clone(self);
        let delay = self.delay;
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire(generation);
        });
        debug!("Scheduled autosave of {} in {:?} (generation {})", self.key, delay, generation);

        state.pending = Some(PendingWrite {
            generation,
            payload: latest,
            timer,
        });
    }

    fn fire(&self, generation: u64) {
        let mut state = self.lock();
        // A cancelled timer that already woke finds its generation gone
        match &state.pending {
            Some(pending) if pending.generation == generation => {}
            _ => return,
        }
        if let Some(pending) = state.pending.take() {
            self.write_locked(&mut state, pending.payload);
        }
    }

    /// Performs one write. Failures are logged and dropped, leaving the last
    /// saved snapshot untouched so the next change retries.
    fn write_locked(&self, state: &mut SchedulerState, payload: Value) -> bool {
        let Some(owner) = self.active_owner(state) else {
            debug!("Autosave of {} skipped: disabled or signed out", self.key);
            return false;
        };

        let record = AutosaveRecord {
            data: payload,
            timestamp: Utc::now(),
            user_id: owner.clone(),
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                error!("Autosave of {} failed to serialize: {}", self.key, e);
                return false;
            }
        };
        if let Err(e) = self.session.store().set(&record_key(&owner, &self.key), &json) {
            error!("Autosave of {} failed: {}", self.key, e);
            return false;
        }

        info!("Auto-saved {} for user {}", self.key, owner);
        state.last_saved = Some((owner, record.data));
        self.session.add_activity(
            &format!("Auto-saved {}", self.key),
            Some(&format!("Data saved at {}", Local::now().format("%H:%M:%S"))),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityMode;
    use crate::storage::{KeyValueStore, Storage};
    use serde_json::json;

    /// Records every write so tests can assert what was ever persisted.
    #[derive(Clone)]
    struct RecordingStore {
        inner: Storage,
        writes: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl RecordingStore {
        fn new(inner: Storage) -> Self {
            Self {
                inner,
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn writes_to(&self, key: &str) -> Vec<Value> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| serde_json::from_str::<AutosaveRecord>(v).unwrap().data)
                .collect()
        }
    }

    impl KeyValueStore for RecordingStore {
        fn get(&self, key: &str) -> crate::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> crate::Result<()> {
            self.inner.set(key, value)?;
            self.writes
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }

        fn remove(&self, key: &str) -> crate::Result<()> {
            self.inner.remove(key)
        }

        fn keys(&self) -> crate::Result<Vec<String>> {
            self.inner.keys()
        }
    }

    fn signed_in(store: RecordingStore) -> SessionStore {
        let session = SessionStore::with_storage(store);
        session.sign_in("alice@example.com", "pw");
        session
    }

    fn options(delay_ms: u64) -> AutosaveOptions {
        AutosaveOptions {
            delay: Duration::from_millis(delay_ms),
            enabled: true,
        }
    }

    fn auto_saves(session: &SessionStore) -> usize {
        session
            .recent_activity()
            .iter()
            .filter(|e| e.action.starts_with("Auto-saved"))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_value_in_window_is_written() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        scheduler.notify_changed(&json!({"draft": "v1"}));
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.notify_changed(&json!({"draft": "v2"}));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // The first timer would have fired by now had it not been cancelled
        assert!(store.writes_to("1_essay").is_empty());
        assert!(scheduler.has_pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.load_value(), Some(json!({"draft": "v2"})));
        assert_eq!(store.writes_to("1_essay"), vec![json!({"draft": "v2"})]);

        let latest = &session.recent_activity()[0];
        assert_eq!(latest.action, "Auto-saved essay");
        assert!(latest.details.as_deref().unwrap().starts_with("Data saved at "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_layout() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session, "notes", options(10)).unwrap();

        scheduler.notify_changed(&vec!["a", "b"]);
        scheduler.force_save();

        let raw = store.get("1_notes").unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["data"], json!(["a", "b"]));
        assert_eq!(parsed["userId"], json!("1"));
        assert!(parsed["timestamp"].as_str().unwrap().parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_save_cancels_pending_timer() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(1000)).unwrap();

        scheduler.notify_changed(&json!({"draft": "v1"}));
        scheduler.force_save();
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.load_data::<Value>(), Some(json!({"draft": "v1"})));

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(store.writes_to("1_essay").len(), 1);
        assert_eq!(auto_saves(&session), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_value_is_not_rescheduled() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        scheduler.notify_changed(&json!({"a": 1, "b": [1, 2]}));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.writes_to("1_essay").len(), 1);

        // Structurally equal, freshly built value
        scheduler.notify_changed(&json!({"b": [1, 2], "a": 1}));
        assert!(!scheduler.has_pending());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.writes_to("1_essay").len(), 1);
        assert_eq!(auto_saves(&session), 1);

        // Changing and then changing back before the window closes writes nothing
        scheduler.notify_changed(&json!({"a": 2, "b": [1, 2]}));
        scheduler.notify_changed(&json!({"a": 1, "b": [1, 2]}));
        assert!(!scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_then_load_is_absent() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        scheduler.notify_changed(&json!("text"));
        scheduler.force_save();
        assert!(scheduler.load_value().is_some());

        scheduler.notify_changed(&json!("more text"));
        scheduler.clear_saved_data();
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.load_value(), None);
        assert_eq!(session.recent_activity()[0].action, "Cleared saved essay");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.load_value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_owner_makes_everything_inert() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = SessionStore::with_storage(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        assert!(!scheduler.is_enabled());
        scheduler.notify_changed(&json!({"draft": "v1"}));
        assert!(!scheduler.has_pending());
        scheduler.force_save();
        scheduler.clear_saved_data();
        assert_eq!(scheduler.load_value(), None);
        assert!(store.keys().unwrap().is_empty());
        assert!(session.recent_activity().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_value_is_saved_for_a_new_owner() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = SessionStore::with_storage(store.clone()).with_identity(IdentityMode::FromEmail);
        let alice = session.sign_in("alice@example.com", "pw");
        let scheduler = AutosaveScheduler::new(session.clone(), "notes", options(100)).unwrap();

        scheduler.notify_changed(&json!({"text": "shared"}));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.writes_to(&record_key(&alice.id, "notes")).len(), 1);

        let bob = session.sign_in("bob@example.com", "pw");
        scheduler.notify_changed(&json!({"text": "shared"}));
        assert!(scheduler.has_pending());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            store.writes_to(&record_key(&bob.id, "notes")),
            vec![json!({"text": "shared"})]
        );
        assert_eq!(scheduler.load_value(), Some(json!({"text": "shared"})));

        // Back under bob the snapshot matches again, so nothing is rescheduled
        scheduler.notify_changed(&json!({"text": "shared"}));
        assert!(!scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_checked_when_timer_fires() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        scheduler.notify_changed(&json!({"draft": "v1"}));
        session.sign_out();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.writes_to("1_essay").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_then_enabled() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(
            session,
            "essay",
            AutosaveOptions {
                delay: Duration::from_millis(100),
                enabled: false,
            },
        )
        .unwrap();

        scheduler.notify_changed(&json!({"draft": "v1"}));
        assert!(!scheduler.has_pending());
        assert!(!scheduler.is_enabled());

        scheduler.set_enabled(true);
        assert!(scheduler.has_pending());
        scheduler.set_enabled(false);
        assert!(!scheduler.has_pending());
        scheduler.set_enabled(true);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.writes_to("1_essay"), vec![json!({"draft": "v1"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_and_empty_key_schedule_nothing() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());

        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();
        scheduler.notify_changed(&Value::Null);
        assert!(!scheduler.has_pending());

        let unnamed = AutosaveScheduler::new(session, "", options(100)).unwrap();
        unnamed.notify_changed(&json!({"draft": "v1"}));
        assert!(!unnamed.has_pending());
        unnamed.force_save();
        assert_eq!(unnamed.load_value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_flushes_pending_write() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(5000)).unwrap();

        scheduler.notify_changed(&json!({"draft": "unsaved"}));
        scheduler.close();

        assert_eq!(store.writes_to("1_essay"), vec![json!({"draft": "unsaved"})]);
        let reopened = AutosaveScheduler::new(session, "essay", options(5000)).unwrap();
        assert_eq!(reopened.load_value(), Some(json!({"draft": "unsaved"})));

        // The aborted timer never writes a second copy
        tokio::time::sleep(Duration::from_millis(6000)).await;
        assert_eq!(store.writes_to("1_essay").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_keeps_snapshot() {
        let store = RecordingStore::new(Storage::in_memory().with_quota(1000));
        let session = signed_in(store.clone());
        let scheduler = AutosaveScheduler::new(session.clone(), "essay", options(100)).unwrap();

        let big = "x".repeat(2000);
        scheduler.notify_changed(&json!({ "draft": big }));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.load_value(), None);
        assert_eq!(auto_saves(&session), 0);

        // Nothing was recorded as saved, so the same value is retried
        scheduler.notify_changed(&json!({ "draft": big }));
        assert!(scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_record_loads_as_absent() {
        let store = RecordingStore::new(Storage::in_memory());
        let session = signed_in(store.clone());
        store.set("1_essay", "{\"data\": ").unwrap();

        let scheduler = AutosaveScheduler::new(session, "essay", options(100)).unwrap();
        assert_eq!(scheduler.load_value(), None);
        assert_eq!(scheduler.load_data::<String>(), None);
    }

    #[test]
    fn test_requires_runtime() {
        let session = SessionStore::with_storage(Storage::in_memory());
        let result = AutosaveScheduler::new(session, "essay", AutosaveOptions::default());
        assert!(matches!(result, Err(DeskError::MissingRuntime)));
    }
}
