/// Request-level error taxonomy for telemetry ingestion.
/// Classifies failures as client errors (don't retry), conflicts, or transient.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    // Client, not retried
    #[error("validation failed: {0}")]
    Validation(String),

    // Caller must resync and resubmit
    #[error("version conflict: current {current_version}, expected {expected_version}")]
    VersionConflict {
        current_version: u64,
        expected_version: u64,
    },

    // Transient
    #[error("circuit open: {operation}")]
    CircuitOpen { operation: String },
    #[error("durability unavailable: {0}")]
    DurabilityUnavailable(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::DurabilityUnavailable(_) | Self::Store(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// HTTP status the ingestion surface answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::VersionConflict { .. } => 409,
            Self::CircuitOpen { .. } | Self::DurabilityUnavailable(_) => 503,
            Self::Store(_) => 500,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::VersionConflict { .. } => "version_conflict",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::DurabilityUnavailable(_) => "durability_unavailable",
            Self::Store(_) => "store_failure",
        }
    }
}
