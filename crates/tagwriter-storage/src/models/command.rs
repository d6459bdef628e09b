use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tagwriter_core::{CommandId, CommandStatus};

use crate::error::{StorageError, StorageResult};

/// Write command queued for a local agent.
///
/// Maps to the `commands` table. The internal insertion sequence used for
/// FIFO claims is not exposed.
///
/// # Examples
///
/// ```
/// use tagwriter_core::CommandStatus;
/// use tagwriter_storage::models::CommandResult;
///
/// let result = CommandResult::success("04A23B1C5D6E80");
/// assert_eq!(result.target_status(), CommandStatus::Done);
///
/// let result = CommandResult::failure("Timed out after 60000ms waiting for a tag");
/// assert_eq!(result.target_status(), CommandStatus::Failed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,

    /// URL to write to the tag
    pub payload: String,

    /// Opaque reference to the record the tag belongs to (a pet id)
    pub subject_ref: String,

    pub status: CommandStatus,

    /// Outcome, present once the command is done or failed
    pub result: Option<CommandResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Returns `true` once the command reached `done` or `failed`.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of a command, reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,

    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success(uid: impl Into<String>) -> Self {
        Self {
            success: true,
            uid: Some(uid.into()),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            uid: None,
            message: Some(message.into()),
        }
    }

    /// Status a command in progress moves to with this result.
    pub fn target_status(&self) -> CommandStatus {
        if self.success {
            CommandStatus::Done
        } else {
            CommandStatus::Failed
        }
    }
}

/// Raw `commands` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CommandRow {
    pub id: String,
    pub payload: String,
    pub subject_ref: String,
    pub status: String,
    pub result_success: Option<bool>,
    pub result_uid: Option<String>,
    pub result_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<CommandRow> for Command {
    type Error = StorageError;

    fn try_from(row: CommandRow) -> StorageResult<Self> {
        let id = row
            .id
            .parse()
            .map_err(|e| StorageError::InvalidRecord(format!("commands.id: {}", e)))?;
        let status = row
            .status
            .parse()
            .map_err(|e| StorageError::InvalidRecord(format!("commands.status: {}", e)))?;

        let result = row.result_success.map(|success| CommandResult {
            success,
            uid: row.result_uid,
            message: row.result_message,
        });

        Ok(Self {
            id,
            payload: row.payload,
            subject_ref: row.subject_ref,
            status,
            result,
            created_at: from_millis(row.created_at, "created_at")?,
            updated_at: from_millis(row.updated_at, "updated_at")?,
        })
    }
}

/// Current time as stored in the database.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64, column: &str) -> StorageResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::InvalidRecord(format!("commands.{}: {}", column, millis)))
}
