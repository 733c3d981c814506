use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Batch already committed")]
    BatchAlreadyCommitted,

    #[error("Invalid backup format: {0}")]
    Backup(String),

    #[error("Patch error: {0}")]
    Patch(String),

    /// Raw runtime-level failure reported by a storage engine adapter.
    /// The execution queue converts it into `EngineCrashed`.
    #[error("Storage engine fault: {0}")]
    EngineFault(String),

    #[error("Storage engine crashed and could not be recovered")]
    EngineCrashed,

    #[error("Database not initialized")]
    NotInitialized,

    #[error("Execution queue closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl DocError {
    /// True when the error signals that the engine's runtime state can no
    /// longer be trusted and the handle must be torn down.
    pub fn is_engine_fault(&self) -> bool {
        match self {
            DocError::EngineFault(_) | DocError::EngineCrashed => true,
            DocError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::InternalMalfunction
                    | rusqlite::ErrorCode::OutOfMemory
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }

    /// True for open failures caused by a damaged backing file. Permission,
    /// lock and path errors (`CannotOpen`) say nothing about the contents and
    /// are not included.
    pub fn is_malformed_file(&self) -> bool {
        match self {
            DocError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DocError>;
