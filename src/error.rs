use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeskError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage quota exceeded writing {key}: {required} bytes required, limit is {limit}")]
    QuotaExceeded {
        key: String,
        required: usize,
        limit: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Autosave requires a running tokio runtime")]
    MissingRuntime,

    #[error("Configuration error: {0}")]
    Configuration(String),
}
