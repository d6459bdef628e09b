use tagwriter_core::{CommandId, CommandStatus};
use thiserror::Error;

/// Storage-specific error types for the command queue.
///
/// Queue contract violations (`NotFound`, `InvalidTransition`) are detected
/// before anything is written, so the stored state is never changed by a
/// rejected operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection or query execution failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration execution failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Entity not found in database
    #[error("Entity not found: {entity_type} with {field}={value}")]
    NotFound {
        entity_type: String,
        field: String,
        value: String,
    },

    /// Command is not in a status that allows the requested change
    #[error("Invalid transition for command {id}: {from} -> {to}")]
    InvalidTransition {
        id: CommandId,
        from: CommandStatus,
        to: CommandStatus,
    },

    /// Stored row could not be mapped back to a model
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    /// Create a not-found error for a command id.
    pub fn command_not_found(id: CommandId) -> Self {
        Self::NotFound {
            entity_type: "command".to_string(),
            field: "id".to_string(),
            value: id.to_string(),
        }
    }
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
