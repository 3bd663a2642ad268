use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::message::MessageId;
use parley_core::domain::outbox::{OutboxJob, OutboxJobId, OutboxJobKind, OutboxJobState};

use super::{parse_timestamp, OutboxRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    id,
    message_id,
    kind,
    payload_json,
    state,
    attempts,
    max_attempts,
    available_at,
    last_error,
    created_at,
    updated_at
 FROM outbox_job";

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn enqueue(&self, job: OutboxJob) -> Result<bool, RepositoryError> {
        // The (message_id, kind) unique index makes redelivery a no-op.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO outbox_job (
                id,
                message_id,
                kind,
                payload_json,
                state,
                attempts,
                max_attempts,
                available_at,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(job.message_id.0)
        .bind(job.kind.as_str())
        .bind(&job.payload_json)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(job.available_at.to_rfc3339())
        .bind(job.last_error.as_deref())
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE state = 'queued' AND available_at <= ?
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(row)?;
            let result = sqlx::query(
                "UPDATE outbox_job
                 SET state = 'running', attempts = attempts + 1, updated_at = ?
                 WHERE id = ? AND state = 'queued'",
            )
            .bind(now.to_rfc3339())
            .bind(&job.id.0)
            .execute(&self.pool)
            .await?;

            // Lost the claim to a concurrent worker.
            if result.rows_affected() == 0 {
                continue;
            }
            job.state = OutboxJobState::Running;
            job.attempts += 1;
            claimed.push(job);
        }

        Ok(claimed)
    }

    async fn mark_completed(&self, id: &OutboxJobId) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE outbox_job SET state = 'completed', last_error = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &OutboxJobId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE outbox_job
             SET state = 'queued', last_error = ?, available_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(available_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &OutboxJobId, error: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE outbox_job SET state = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &OutboxJobId) -> Result<Option<OutboxJob>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }
}

fn job_from_row(row: SqliteRow) -> Result<OutboxJob, RepositoryError> {
    let kind_raw: String = row.get("kind");
    let kind = OutboxJobKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown outbox job kind `{kind_raw}`")))?;
    let state_raw: String = row.get("state");
    let state = OutboxJobState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown outbox job state `{state_raw}`")))?;

    Ok(OutboxJob {
        id: OutboxJobId(row.get("id")),
        message_id: MessageId(row.get("message_id")),
        kind,
        payload_json: row.get("payload_json"),
        state,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        available_at: parse_timestamp("available_at", &row.get::<String, _>("available_at"))?,
        last_error: row.get("last_error"),
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp("updated_at", &row.get::<String, _>("updated_at"))?,
    })
}
