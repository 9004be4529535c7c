use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::DeskError;
use crate::storage::{Storage, DEFAULT_QUOTA_BYTES};

pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_PRINCIPAL_ID: &str = "1";

const ENV_DATA_DIR: &str = "RESEARCH_DESK_DATA_DIR";
const ENV_QUOTA_BYTES: &str = "RESEARCH_DESK_QUOTA_BYTES";
const ENV_AUTOSAVE_MS: &str = "RESEARCH_DESK_AUTOSAVE_MS";
const ENV_IDENTITY: &str = "RESEARCH_DESK_IDENTITY";

/// How a principal id is derived at sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    /// Every principal gets the same id.
    Fixed(String),
    /// Stable id from the SHA-256 of the lower-cased email.
    FromEmail,
}

impl Default for IdentityMode {
    fn default() -> Self {
        IdentityMode::Fixed(DEFAULT_PRINCIPAL_ID.to_string())
    }
}

impl IdentityMode {
    pub fn principal_id(&self, email: &str) -> String {
        match self {
            IdentityMode::Fixed(id) => id.clone(),
            IdentityMode::FromEmail => {
                let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
                digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
            }
        }
    }

    /// Parses `fixed:<id>` or `email`.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("email") {
            return Ok(IdentityMode::FromEmail);
        }
        match raw.strip_prefix("fixed:") {
            // Ids may not contain '_', which separates owner from logical key
            Some(id) if !id.is_empty() && !id.contains('_') => Ok(IdentityMode::Fixed(id.to_string())),
            _ => Err(DeskError::Configuration(format!(
                "invalid identity mode `{}`; expected `fixed:<id>` or `email`",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeskConfig {
    /// None uses the process-wide store under the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub quota_bytes: Option<usize>,
    pub autosave_delay: Duration,
    pub identity: IdentityMode,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            quota_bytes: Some(DEFAULT_QUOTA_BYTES),
            autosave_delay: DEFAULT_AUTOSAVE_DELAY,
            identity: IdentityMode::default(),
        }
    }
}

impl DeskConfig {
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup(ENV_QUOTA_BYTES) {
            let bytes: usize = raw.trim().parse().map_err(|_| {
                DeskError::Configuration(format!("{} must be a byte count, got `{}`", ENV_QUOTA_BYTES, raw))
            })?;
            // 0 disables the quota
            config.quota_bytes = if bytes == 0 { None } else { Some(bytes) };
        }

        if let Some(raw) = lookup(ENV_AUTOSAVE_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                DeskError::Configuration(format!("{} must be milliseconds, got `{}`", ENV_AUTOSAVE_MS, raw))
            })?;
            config.autosave_delay = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup(ENV_IDENTITY) {
            config.identity = IdentityMode::parse(&raw)?;
        }

        Ok(config)
    }

    pub fn state_file(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("state.json"),
            None => Storage::persistence_file(),
        }
    }

    pub fn open_storage(&self) -> crate::Result<Storage> {
        let storage = match &self.data_dir {
            Some(dir) => Storage::with_path(dir.join("state.json"))?,
            None => Storage::new()?,
        };
        Ok(match self.quota_bytes {
            Some(bytes) => storage.with_quota(bytes),
            None => storage,
        })
    }
}
