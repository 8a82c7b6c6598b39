//! PostgreSQL adapter for approval storage.
//!
//! Status compare-and-swap and confirmation writes both lock the request row
//! (`SELECT ... FOR UPDATE`) inside a transaction, which gives the same
//! serialization the in-memory adapter gets from its single lock.

use crate::traits::{ApprovalStorage, ConfirmationStore, QueryWindow, RequestStore, StatusUpdate};
use crate::{StorageError, StorageResult};
use approval_types::{
    ApprovalRequest, ApprovalStatus, ApproverId, Confirmation, ConfirmationId, Decision,
    DomainKind, RecordedConfirmation, RequestDomain, RequestId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeSet;

const REQUEST_COLUMNS: &str = r#"
    request_id, kind, domain, required_approvals, approvers, created_by, status,
    created_at, updated_at, executed_at, execution_reference, submission_reference,
    failure_reason, execution_attempts, submission_generation
"#;

const CONFIRMATION_COLUMNS: &str = r#"
    confirmation_id, request_id, approver_id, decision, proof, note, recorded_at,
    superseded_at, superseded_by
"#;

/// PostgreSQL-backed approval storage.
#[derive(Clone)]
pub struct PostgresApprovalStorage {
    pool: PgPool,
}

impl PostgresApprovalStorage {
    /// Open a connection pool. Call [`init_schema`](Self::init_schema) before use.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS approval_requests (
                request_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                domain JSONB NOT NULL,
                required_approvals BIGINT NOT NULL,
                approvers JSONB NOT NULL,
                created_by TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                executed_at TIMESTAMPTZ,
                execution_reference TEXT,
                submission_reference TEXT,
                failure_reason TEXT,
                execution_attempts BIGINT NOT NULL DEFAULT 0,
                submission_generation BIGINT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            ALTER TABLE approval_requests
                ADD COLUMN IF NOT EXISTS submission_generation BIGINT NOT NULL DEFAULT 0
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS approval_requests_kind_status_idx
                ON approval_requests (kind, status, created_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_confirmations (
                seq BIGSERIAL PRIMARY KEY,
                confirmation_id TEXT NOT NULL UNIQUE,
                request_id TEXT NOT NULL REFERENCES approval_requests (request_id),
                approver_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                proof BYTEA,
                note TEXT,
                recorded_at TIMESTAMPTZ NOT NULL,
                superseded_at TIMESTAMPTZ,
                superseded_by TEXT
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS approval_confirmations_active_idx
                ON approval_confirmations (request_id, approver_id)
                WHERE superseded_at IS NULL
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn lock_request(
        tx: &mut Transaction<'_, Postgres>,
        request_id: &RequestId,
    ) -> StorageResult<ApprovalRequest> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE request_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(request_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match row {
            Some(row) => request_from_row(&row),
            None => Err(StorageError::NotFound(request_id.to_string())),
        }
    }
}

#[async_trait]
impl RequestStore for PostgresApprovalStorage {
    async fn create_request(&self, request: ApprovalRequest) -> StorageResult<RequestId> {
        let domain = serde_json::to_value(&request.domain)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let approvers = serde_json::to_value(&request.designated_approvers)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO approval_requests
                (request_id, kind, domain, required_approvals, approvers, created_by, status,
                 created_at, updated_at, executed_at, execution_reference, submission_reference,
                 failure_reason, execution_attempts, submission_generation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id.as_str())
        .bind(request.kind().as_str())
        .bind(domain)
        .bind(i64::from(request.required_approvals))
        .bind(approvers)
        .bind(request.created_by.as_str())
        .bind(request.status.as_str())
        .bind(request.created_at)
        .bind(request.updated_at)
        .bind(request.executed_at)
        .bind(request.execution_reference.as_deref())
        .bind(request.submission_reference.as_deref())
        .bind(request.failure_reason.as_deref())
        .bind(i64::from(request.execution_attempts))
        .bind(i64::from(request.submission_generation))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        Ok(request.id)
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE request_id = $1");
        let row = sqlx::query(&sql)
            .bind(request_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn update_status(
        &self,
        request_id: &RequestId,
        expected: ApprovalStatus,
        new: ApprovalStatus,
        update: StatusUpdate,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<ApprovalRequest> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut record = Self::lock_request(&mut tx, request_id).await?;
        if record.status != expected {
            return Err(StorageError::Conflict {
                request_id: request_id.clone(),
                expected,
                found: record.status,
            });
        }
        if let Some(attempt) = update.expected_attempt {
            if record.execution_attempts != attempt {
                return Err(StorageError::StaleAttempt {
                    request_id: request_id.clone(),
                    expected: attempt,
                    found: record.execution_attempts,
                });
            }
        }

        record.status = new;
        record.updated_at = updated_at;
        update.apply(&mut record);

        let result = sqlx::query(
            r#"
            UPDATE approval_requests
               SET status = $1,
                   updated_at = $2,
                   executed_at = $3,
                   execution_reference = $4,
                   submission_reference = $5,
                   failure_reason = $6,
                   execution_attempts = $7,
                   submission_generation = $8
             WHERE request_id = $9
               AND status = $10
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .bind(record.executed_at)
        .bind(record.execution_reference.as_deref())
        .bind(record.submission_reference.as_deref())
        .bind(record.failure_reason.as_deref())
        .bind(i64::from(record.execution_attempts))
        .bind(i64::from(record.submission_generation))
        .bind(request_id.as_str())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Backend(format!(
                "status update for request {request_id} affected no rows while locked"
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(record)
    }

    async fn list_pending(
        &self,
        domain: DomainKind,
        window: QueryWindow,
    ) -> StorageResult<Vec<ApprovalRequest>> {
        let terminal = ApprovalStatus::ALL
            .into_iter()
            .filter(|status| status.is_terminal())
            .map(|status| status.as_str().to_string())
            .collect::<Vec<_>>();

        let rows = if window.limit == 0 {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM approval_requests \
                 WHERE kind = $1 AND NOT (status = ANY($2)) \
                 ORDER BY created_at ASC, request_id ASC OFFSET $3"
            );
            sqlx::query(&sql)
                .bind(domain.as_str())
                .bind(terminal.clone())
                .bind(to_i64(window.offset)?)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM approval_requests \
                 WHERE kind = $1 AND NOT (status = ANY($2)) \
                 ORDER BY created_at ASC, request_id ASC LIMIT $3 OFFSET $4"
            );
            sqlx::query(&sql)
                .bind(domain.as_str())
                .bind(terminal.clone())
                .bind(to_i64(window.limit)?)
                .bind(to_i64(window.offset)?)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl ConfirmationStore for PostgresApprovalStorage {
    async fn record_confirmation(
        &self,
        confirmation: Confirmation,
    ) -> StorageResult<RecordedConfirmation> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let request = Self::lock_request(&mut tx, &confirmation.request_id).await?;
        if !request.status.accepts_decisions() {
            return Err(StorageError::Closed {
                request_id: request.id,
                status: request.status,
            });
        }

        let sql = format!(
            "UPDATE approval_confirmations \
                SET superseded_at = $1, superseded_by = $2 \
              WHERE request_id = $3 AND approver_id = $4 AND superseded_at IS NULL \
             RETURNING {CONFIRMATION_COLUMNS}"
        );
        let superseded = sqlx::query(&sql)
            .bind(confirmation.timestamp)
            .bind(confirmation.id.as_str())
            .bind(confirmation.request_id.as_str())
            .bind(confirmation.approver_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .as_ref()
            .map(confirmation_from_row)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO approval_confirmations
                (confirmation_id, request_id, approver_id, decision, proof, note, recorded_at,
                 superseded_at, superseded_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NULL)
            "#,
        )
        .bind(confirmation.id.as_str())
        .bind(confirmation.request_id.as_str())
        .bind(confirmation.approver_id.as_str())
        .bind(confirmation.decision.as_str())
        .bind(confirmation.proof.as_deref())
        .bind(confirmation.note.as_deref())
        .bind(confirmation.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(RecordedConfirmation {
            confirmation,
            superseded,
        })
    }

    async fn active_confirmations(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Confirmation>> {
        let sql = format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM approval_confirmations \
             WHERE request_id = $1 AND superseded_at IS NULL ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(request_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(confirmation_from_row).collect()
    }

    async fn confirmation_history(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Confirmation>> {
        let sql = format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM approval_confirmations \
             WHERE request_id = $1 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(request_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(confirmation_from_row).collect()
    }
}

impl ApprovalStorage for PostgresApprovalStorage {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }
}

fn request_from_row(row: &PgRow) -> StorageResult<ApprovalRequest> {
    let domain: serde_json::Value = get(row, "domain")?;
    let domain: RequestDomain =
        serde_json::from_value(domain).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let approvers: serde_json::Value = get(row, "approvers")?;
    let designated_approvers: BTreeSet<ApproverId> = serde_json::from_value(approvers)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let status: String = get(row, "status")?;
    let status = status
        .parse::<ApprovalStatus>()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(ApprovalRequest {
        id: RequestId::new(get::<String>(row, "request_id")?),
        domain,
        required_approvals: to_u32(get(row, "required_approvals")?)?,
        designated_approvers,
        created_by: ApproverId::new(get::<String>(row, "created_by")?),
        status,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        executed_at: get(row, "executed_at")?,
        execution_reference: get(row, "execution_reference")?,
        submission_reference: get(row, "submission_reference")?,
        failure_reason: get(row, "failure_reason")?,
        execution_attempts: to_u32(get(row, "execution_attempts")?)?,
        submission_generation: to_u32(get(row, "submission_generation")?)?,
    })
}

fn confirmation_from_row(row: &PgRow) -> StorageResult<Confirmation> {
    let decision: String = get(row, "decision")?;
    let decision = match decision.as_str() {
        "approve" => Decision::Approve,
        "reject" => Decision::Reject,
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown decision '{other}'"
            )))
        }
    };

    Ok(Confirmation {
        id: ConfirmationId::new(get::<String>(row, "confirmation_id")?),
        request_id: RequestId::new(get::<String>(row, "request_id")?),
        approver_id: ApproverId::new(get::<String>(row, "approver_id")?),
        decision,
        proof: get(row, "proof")?,
        note: get(row, "note")?,
        timestamp: get(row, "recorded_at")?,
        superseded_at: get(row, "superseded_at")?,
        superseded_by: get::<Option<String>>(row, "superseded_by")?.map(ConfirmationId::new),
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StorageError::Serialization(format!("column {column}: {e}")))
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Duplicate(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::Backend("window value too large".to_string()))
}

fn to_u32(value: i64) -> StorageResult<u32> {
    u32::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("counter out of range: {value}")))
}
