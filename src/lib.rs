pub mod activity;
pub mod autosave;
pub mod config;
pub mod error;
pub mod registry;
pub mod session;
pub mod storage;

pub use activity::{ActivityEntry, ActivityLog};
pub use autosave::{AutosaveOptions, AutosaveRecord, AutosaveScheduler};
pub use config::{DeskConfig, IdentityMode};
pub use error::DeskError;
pub use registry::{AutosaveInfo, AutosaveRegistry};
pub use session::{Principal, SessionStore};
pub use storage::{KeyValueStore, Storage};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, DeskError>;
