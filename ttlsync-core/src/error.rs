//! Error types shared by the sync engine

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while normalizing, planning or applying a sync
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Dataset not found in document: {0}")]
    UnknownDataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}
