use tabwatch_core::IngestError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("circuit open: {operation}")]
    CircuitOpen { operation: String },
}

impl StoreError {
    /// Whether another attempt could succeed. `NotFound` and `Duplicate` are
    /// answers from a healthy store, not failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Io(_) | Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Duplicate(_) => "duplicate",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Unavailable(_) => "unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            // Only key collisions are duplicates; NOT NULL and CHECK failures stay database errors.
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && matches!(
                        err.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    ) =>
            {
                StoreError::Duplicate(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CircuitOpen { operation } => IngestError::CircuitOpen { operation },
            other => IngestError::Store(other.to_string()),
        }
    }
}
