use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use zeroize::Zeroize;

use crate::activity::{ActivityEntry, ActivityLog};
use crate::config::IdentityMode;
use crate::storage::{read_json, KeyValueStore, Storage};

/// Store key holding the serialized current principal.
pub const USER_KEY: &str = "user";
/// Store key holding the serialized recent-activity log.
pub const ACTIVITY_KEY: &str = "recentActivity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "avatar", default)]
    pub avatar_ref: Option<String>,
}

#[derive(Default)]
struct SessionState {
    principal: Option<Principal>,
    activity: ActivityLog,
}

/// Owner of the current principal and the recent-activity log.
///
/// Cloning yields another handle onto the same session, so schedulers and
/// registries built from it observe sign-in and sign-out as they happen.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<RwLock<SessionState>>,
    store: Arc<dyn KeyValueStore>,
    identity: IdentityMode,
}

impl SessionStore {
    /// Session over the process-wide store.
    pub fn new() -> crate::Result<Self> {
        let storage = Storage::new()?;
        Ok(Self::with_storage(storage))
    }

    pub fn with_storage<S: KeyValueStore + 'static>(storage: S) -> Self {
        Self::with_shared_store(Arc::new(storage))
    }

    /// Restores any persisted principal and activity log. Malformed records
    /// are treated as absent.
    pub fn with_shared_store(store: Arc<dyn KeyValueStore>) -> Self {
        let principal: Option<Principal> = read_json(store.as_ref(), USER_KEY);
        let activity = read_json::<Vec<ActivityEntry>>(store.as_ref(), ACTIVITY_KEY)
            .map(ActivityLog::from_entries)
            .unwrap_or_default();

        if let Some(p) = &principal {
            info!("Restored session for {}", p.id);
        }

        Self {
            state: Arc::new(RwLock::new(SessionState { principal, activity })),
            store,
            identity: IdentityMode::default(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityMode) -> Self {
        self.identity = identity;
        self
    }

    pub(crate) fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Credentials are checked by the caller; any email and password are
    /// accepted here.
    pub fn sign_in(&self, email: &str, _password: &str) -> Principal {
        let principal = self.build_principal(email, None);
        self.adopt(principal.clone(), "User signed in");
        principal
    }

    pub fn sign_up(&self, email: &str, _password: &str, name: Option<&str>) -> Principal {
        let principal = self.build_principal(email, name);
        self.adopt(principal.clone(), "User account created");
        principal
    }

    pub fn sign_out(&self) {
        {
            let mut state = self.write_state();
            if let Some(mut principal) = state.principal.take() {
                info!("Signing out {}", principal.id);
                principal.zeroize();
            }
            state.activity.clear();
        }

        for key in [USER_KEY, ACTIVITY_KEY] {
            if let Err(e) = self.store.remove(key) {
                error!("Failed to remove {} on sign-out: {}", key, e);
            }
        }
    }

    /// Prepends an entry and persists the truncated log. Works with or
    /// without a signed-in principal.
    pub fn add_activity(&self, action: &str, details: Option<&str>) {
        let mut state = self.write_state();
        state.activity.record(action, details);

        let serialized = match serde_json::to_string(&state.activity.entries()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize activity log: {}", e);
                return;
            }
        };
        // Written under the lock so the persisted log never goes backwards
        if let Err(e) = self.store.set(ACTIVITY_KEY, &serialized) {
            error!("Failed to persist activity log: {}", e);
        }
    }

    pub fn principal(&self) -> Option<Principal> {
        self.read_state().principal.clone()
    }

    pub fn owner_id(&self) -> Option<String> {
        self.read_state().principal.as_ref().map(|p| p.id.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.read_state().principal.is_some()
    }

    /// Most recent first.
    pub fn recent_activity(&self) -> Vec<ActivityEntry> {
        self.read_state().activity.entries()
    }

    fn build_principal(&self, email: &str, name: Option<&str>) -> Principal {
        let local_part = email.split('@').next().unwrap_or(email);
        let display_name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(local_part);

        Principal {
            id: self.identity.principal_id(email),
            email: email.to_string(),
            display_name: display_name.to_string(),
            avatar_ref: None,
        }
    }

    fn adopt(&self, principal: Principal, action: &str) {
        match serde_json::to_string(&principal) {
            Ok(json) => {
                if let Err(e) = self.store.set(USER_KEY, &json) {
                    error!("Failed to persist principal {}: {}", principal.id, e);
                }
            }
            Err(e) => error!("Failed to serialize principal {}: {}", principal.id, e),
        }

        info!("Principal {} is now active", principal.id);
        {
            let mut state = self.write_state();
            if let Some(mut previous) = state.principal.replace(principal) {
                previous.zeroize();
            }
        }
        self.add_activity(action, None);
    }
}
