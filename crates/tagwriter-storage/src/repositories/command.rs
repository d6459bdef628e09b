#![allow(async_fn_in_trait)]

use std::time::Duration;

use sqlx::SqlitePool;
use tagwriter_core::{CommandId, CommandStatus, SubjectRef, TagPayload};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::models::command::{CommandRow, now_millis};
use crate::models::{Command, CommandResult};

const SELECT_COMMAND: &str = r#"
    SELECT id, payload, subject_ref, status,
           result_success, result_uid, result_message,
           created_at, updated_at
    FROM commands
"#;

/// Durable work queue of write commands.
///
/// Status changes are compare-and-swap updates keyed by id and expected
/// prior status, so concurrent callers never both win the same transition.
///
/// # Implementation Note
///
/// This trait uses native async trait methods (Edition 2024 feature),
/// eliminating the need for the async-trait crate while maintaining
/// full async/await support in trait methods.
pub trait CommandQueue: Send + Sync {
    /// Create a `pending` command.
    async fn enqueue(&self, payload: &TagPayload, subject_ref: &SubjectRef)
    -> StorageResult<Command>;

    /// Move the oldest `pending` command to `in_progress` and return it.
    async fn claim_next(&self) -> StorageResult<Option<Command>>;

    /// Record the outcome of an `in_progress` command.
    ///
    /// Fails with [`StorageError::InvalidTransition`] if the command is in
    /// any other status, and [`StorageError::NotFound`] if it does not exist.
    async fn report_result(&self, id: CommandId, result: &CommandResult)
    -> StorageResult<Command>;

    /// Find a command by id.
    async fn get(&self, id: CommandId) -> StorageResult<Option<Command>>;

    /// Fail every `pending` command created more than `ttl` ago.
    ///
    /// Returns the commands that were expired.
    async fn expire_pending(&self, ttl: Duration) -> StorageResult<Vec<Command>>;

    /// Most recently created commands, newest first.
    async fn list_recent(&self, limit: u32) -> StorageResult<Vec<Command>>;
}

/// SQLite implementation of CommandQueue
#[derive(Debug, Clone)]
pub struct SqliteCommandQueue {
    pool: SqlitePool,
}

impl SqliteCommandQueue {
    /// Create a new SQLite command queue
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &str) -> StorageResult<Option<Command>> {
        let row = sqlx::query_as::<_, CommandRow>(&format!("{SELECT_COMMAND} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Command::try_from).transpose()
    }

    async fn fetch_existing(&self, id: &str) -> StorageResult<Command> {
        self.fetch(id).await?.ok_or_else(|| StorageError::NotFound {
            entity_type: "command".to_string(),
            field: "id".to_string(),
            value: id.to_string(),
        })
    }
}

impl CommandQueue for SqliteCommandQueue {
    async fn enqueue(
        &self,
        payload: &TagPayload,
        subject_ref: &SubjectRef,
    ) -> StorageResult<Command> {
        let id = CommandId::new().to_string();
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO commands (id, payload, subject_ref, status, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(payload.as_str())
        .bind(subject_ref.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(command_id = %id, subject_ref = %subject_ref, "Command enqueued");
        self.fetch_existing(&id).await
    }

    async fn claim_next(&self) -> StorageResult<Option<Command>> {
        loop {
            let candidate: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM commands
                WHERE status = 'pending'
                ORDER BY seq
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some((id,)) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                r#"
                UPDATE commands
                SET status = 'in_progress', updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(now_millis())
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                info!(command_id = %id, "Command claimed");
                return self.fetch(&id).await;
            }

            // Another claimer won this one; try the next oldest.
            debug!(command_id = %id, "Lost claim race");
        }
    }

    async fn report_result(
        &self,
        id: CommandId,
        result: &CommandResult,
    ) -> StorageResult<Command> {
        let id_text = id.to_string();
        let target = result.target_status();

        let updated = sqlx::query(
            r#"
            UPDATE commands
            SET status = ?, result_success = ?, result_uid = ?, result_message = ?,
                updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(target.as_str())
        .bind(result.success)
        .bind(&result.uid)
        .bind(&result.message)
        .bind(now_millis())
        .bind(&id_text)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.fetch(&id_text).await? {
                Some(current) => Err(StorageError::InvalidTransition {
                    id,
                    from: current.status,
                    to: target,
                }),
                None => Err(StorageError::command_not_found(id)),
            };
        }

        info!(command_id = %id, status = %target, "Command result recorded");
        self.fetch_existing(&id_text).await
    }

    async fn get(&self, id: CommandId) -> StorageResult<Option<Command>> {
        self.fetch(&id.to_string()).await
    }

    async fn expire_pending(&self, ttl: Duration) -> StorageResult<Vec<Command>> {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(ttl_millis);
        let message = format!(
            "expired: no agent claimed the command within {}s",
            ttl.as_secs()
        );

        let candidates: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM commands
            WHERE status = 'pending' AND created_at <= ?
            ORDER BY seq
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::with_capacity(candidates.len());
        for (id,) in candidates {
            let updated = sqlx::query(
                r#"
                UPDATE commands
                SET status = ?, result_success = 0, result_message = ?, updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(CommandStatus::Failed.as_str())
            .bind(&message)
            .bind(now_millis())
            .bind(&id)
            .execute(&self.pool)
            .await?;

            // A claim may have won between the select and the update.
            if updated.rows_affected() == 1 {
                info!(command_id = %id, ttl_secs = ttl.as_secs(), "Pending command expired");
                expired.push(self.fetch_existing(&id).await?);
            }
        }

        Ok(expired)
    }

    async fn list_recent(&self, limit: u32) -> StorageResult<Vec<Command>> {
        let rows = sqlx::query_as::<_, CommandRow>(&format!(
            "{SELECT_COMMAND} ORDER BY seq DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Command::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    async fn queue() -> SqliteCommandQueue {
        let db = Database::in_memory().await.unwrap();
        SqliteCommandQueue::new(db.pool().clone())
    }

    fn payload(n: u32) -> TagPayload {
        TagPayload::new(&format!("https://vet.example/pet/{}", n)).unwrap()
    }

    fn subject(n: u32) -> SubjectRef {
        SubjectRef::new(&format!("pet-{}", n)).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending() {
        let queue = queue().await;
        let command = queue.enqueue(&payload(1), &subject(1)).await.unwrap();

        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.payload, "https://vet.example/pet/1");
        assert_eq!(command.subject_ref, "pet-1");
        assert!(command.result.is_none());
        assert_eq!(queue.get(command.id).await.unwrap(), Some(command));
    }

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let queue = queue().await;
        let first = queue.enqueue(&payload(1), &subject(1)).await.unwrap();
        let second = queue.enqueue(&payload(2), &subject(2)).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, CommandStatus::InProgress);

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let queue = queue().await;
        let command = queue.enqueue(&payload(7), &subject(7)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let reported = queue
            .report_result(claimed.id, &CommandResult::success("04A23B1C5D6E80"))
            .await
            .unwrap();
        assert_eq!(reported.status, CommandStatus::Done);

        let stored = queue.get(command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Done);
        assert_eq!(
            stored.result.unwrap().uid.as_deref(),
            Some("04A23B1C5D6E80")
        );
        assert!(stored.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn test_failure_result() {
        let queue = queue().await;
        queue.enqueue(&payload(1), &subject(1)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let reported = queue
            .report_result(claimed.id, &CommandResult::failure("Write cancelled"))
            .await
            .unwrap();
        assert_eq!(reported.status, CommandStatus::Failed);
        assert_eq!(
            reported.result.unwrap().message.as_deref(),
            Some("Write cancelled")
        );
    }

    #[tokio::test]
    async fn test_report_on_pending_rejected() {
        let queue = queue().await;
        let command = queue.enqueue(&payload(1), &subject(1)).await.unwrap();

        let result = queue
            .report_result(command.id, &CommandResult::success("04AABBCC"))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidTransition {
                from: CommandStatus::Pending,
                to: CommandStatus::Done,
                ..
            })
        ));

        let stored = queue.get(command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_report_keeps_first_result() {
        let queue = queue().await;
        queue.enqueue(&payload(1), &subject(1)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        queue
            .report_result(claimed.id, &CommandResult::success("04AABBCC"))
            .await
            .unwrap();
        let second = queue
            .report_result(claimed.id, &CommandResult::failure("late failure"))
            .await;

        assert!(matches!(
            second,
            Err(StorageError::InvalidTransition {
                from: CommandStatus::Done,
                ..
            })
        ));
        let stored = queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Done);
        assert_eq!(stored.result, Some(CommandResult::success("04AABBCC")));
    }

    #[tokio::test]
    async fn test_report_unknown_command() {
        let queue = queue().await;
        let result = queue
            .report_result(CommandId::new(), &CommandResult::success("04AABBCC"))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_get_unknown_command() {
        let queue = queue().await;
        assert!(queue.get(CommandId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_only_old_pending() {
        let queue = queue().await;
        let claimed = queue.enqueue(&payload(1), &subject(1)).await.unwrap();
        let pending = queue.enqueue(&payload(2), &subject(2)).await.unwrap();
        queue.claim_next().await.unwrap();

        let none = queue.expire_pending(Duration::from_secs(900)).await.unwrap();
        assert!(none.is_empty());

        let expired = queue.expire_pending(Duration::ZERO).await.unwrap();
        let ids: Vec<_> = expired.iter().map(|command| command.id).collect();
        assert_eq!(ids, vec![pending.id]);

        let stored = queue.get(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        let result = stored.result.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.message.as_deref(),
            Some("expired: no agent claimed the command within 0s")
        );

        let claimed = queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, CommandStatus::InProgress);
    }

    #[tokio::test]
    async fn test_expired_command_cannot_be_claimed_or_reported() {
        let queue = queue().await;
        let command = queue.enqueue(&payload(1), &subject(1)).await.unwrap();
        queue.expire_pending(Duration::ZERO).await.unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert!(matches!(
            queue
                .report_result(command.id, &CommandResult::success("04AABBCC"))
                .await,
            Err(StorageError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_recent_newest_first() {
        let queue = queue().await;
        for n in 1..=5 {
            queue.enqueue(&payload(n), &subject(n)).await.unwrap();
        }

        let recent = queue.list_recent(3).await.unwrap();
        let subjects: Vec<_> = recent.iter().map(|c| c.subject_ref.as_str()).collect();
        assert_eq!(subjects, vec!["pet-5", "pet-4", "pet-3"]);
    }
}
