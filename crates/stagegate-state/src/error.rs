//! Error types for stagegate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the repository traits in [`crate::storage_traits`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("pipeline not found: {pipeline_id}")]
    PipelineNotFound { pipeline_id: String },

    #[error("pipeline already exists: {pipeline_id}")]
    PipelineExists { pipeline_id: String },

    /// A compare-and-swap lost against a concurrent writer.
    #[error("version conflict on {pipeline_id}: expected {expected}, found {actual}")]
    VersionConflict {
        pipeline_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: String },

    #[error("duplicate record: {id}")]
    Duplicate { id: String },

    /// Attempted write to a record that is frozen (approved artifact, written decision).
    #[error("record is immutable: {id}")]
    ImmutableRecord { id: String },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_display() {
        let err = StorageError::VersionConflict {
            pipeline_id: "p-1".to_string(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("p-1"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 4"));
    }

    #[test]
    fn test_state_error_converts_to_backend() {
        let err: StorageError = StateError::Connection("refused".to_string()).into();
        assert!(matches!(err, StorageError::Backend(ref m) if m.contains("refused")));
    }
}
