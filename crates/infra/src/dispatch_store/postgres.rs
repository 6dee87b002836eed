//! Postgres-backed dispatch store and outbox.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};
use uuid::Uuid;

use supplyline_core::{
    AttemptId, DispatchLogId, MaterialId, OutboxId, Page, Pagination, RequestId, TaskId,
};
use supplyline_dispatch::{
    AllocationAttempt, AttemptStatus, DemandRequest, DispatchLog, DispatchTask, LogAction,
    RequestStatus, TaskStatus, Urgency,
};
use supplyline_stock::LockItem;

use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore, RetryPolicy};
use crate::store::StoreError;
use crate::store::pg::{begin_with_lock_timeout, ensure_schema, map_sqlx_error, to_i64, to_u64};

use super::r#trait::{DispatchStore, DispatchTx};

const REQUEST_COLUMNS: &str = "id, material_id, quantity, urgency, target_area, description, \
     status, audit_remark, created_at, updated_at, deleted_at";

const TASK_COLUMNS: &str =
    "id, request_id, status, operator, logistics_ref, created_at, updated_at";

const ATTEMPT_COLUMNS: &str =
    "id, request_id, items, status, created_at, updated_at, lock_released_at";

const OUTBOX_COLUMNS: &str = "id, topic, payload, status, attempts, retry_policy, last_error, \
     scheduled_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresDispatchStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresDispatchStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        ensure_schema(&self.pool, "dispatch", super::SCHEMA).await
    }
}

struct PgDispatchTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl DispatchTx for PgDispatchTx {
    async fn request_for_update(
        &mut self,
        id: RequestId,
    ) -> Result<Option<DemandRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM demand_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("request_for_update", e))?;
        row.map(|r| decode::<RequestRow>(&r).and_then(DemandRequest::try_from))
            .transpose()
    }

    async fn insert_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO demand_requests (
                id, material_id, quantity, urgency, target_area, description,
                status, audit_remark, created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.material_id.as_uuid())
        .bind(request.quantity)
        .bind(request.urgency.as_str())
        .bind(&request.target_area)
        .bind(&request.description)
        .bind(request.status.as_str())
        .bind(&request.audit_remark)
        .bind(request.created_at)
        .bind(request.updated_at)
        .bind(request.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_request", e))?;
        Ok(())
    }

    async fn update_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE demand_requests
            SET status = $2,
                audit_remark = $3,
                updated_at = $4,
                deleted_at = $5
            WHERE id = $1
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.status.as_str())
        .bind(&request.audit_remark)
        .bind(request.updated_at)
        .bind(request.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_request", e))?;
        Ok(())
    }

    async fn append_log(&mut self, log: &DispatchLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_logs (
                id, request_id, prev_status, curr_status, action, operator, remark, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.request_id.as_uuid())
        .bind(log.prev_status.map(|s| s.as_str()))
        .bind(log.curr_status.as_str())
        .bind(log.action.as_str())
        .bind(&log.operator)
        .bind(&log.remark)
        .bind(log.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    async fn insert_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_tasks (
                id, request_id, status, operator, logistics_ref, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.request_id.as_uuid())
        .bind(task.status.as_str())
        .bind(&task.operator)
        .bind(&task.logistics_ref)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;
        Ok(())
    }

    async fn task_for_request_for_update(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE request_id = $1 FOR UPDATE"
        ))
        .bind(request_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("task_for_request_for_update", e))?;
        row.map(|r| decode::<TaskRow>(&r).and_then(DispatchTask::try_from))
            .transpose()
    }

    async fn update_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE dispatch_tasks
            SET status = $2, logistics_ref = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(&task.logistics_ref)
        .bind(task.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;
        Ok(())
    }

    async fn attempt_for_update(
        &mut self,
        id: AttemptId,
    ) -> Result<Option<AllocationAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM allocation_attempts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("attempt_for_update", e))?;
        row.map(|r| decode::<AttemptRow>(&r).and_then(AllocationAttempt::try_from))
            .transpose()
    }

    async fn in_flight_attempt(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<AllocationAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM allocation_attempts \
             WHERE request_id = $1 AND status IN ('Requested', 'Locked')"
        ))
        .bind(request_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("in_flight_attempt", e))?;
        row.map(|r| decode::<AttemptRow>(&r).and_then(AllocationAttempt::try_from))
            .transpose()
    }

    async fn insert_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
        let items = encode_json("attempt items", &attempt.items)?;
        sqlx::query(
            r#"
            INSERT INTO allocation_attempts (
                id, request_id, items, status, created_at, updated_at, lock_released_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.id.as_uuid())
        .bind(attempt.request_id.as_uuid())
        .bind(items)
        .bind(attempt.status.as_str())
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .bind(attempt.lock_released_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_attempt", e))?;
        Ok(())
    }

    async fn update_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE allocation_attempts
            SET status = $2, updated_at = $3, lock_released_at = $4
            WHERE id = $1
            "#,
        )
        .bind(attempt.id.as_uuid())
        .bind(attempt.status.as_str())
        .bind(attempt.updated_at)
        .bind(attempt.lock_released_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_attempt", e))?;
        Ok(())
    }

    async fn delete_attempt(&mut self, id: AttemptId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM allocation_attempts WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_attempt", e))?;
        Ok(())
    }

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        let retry_policy = encode_json("retry policy", &message.retry_policy)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, topic, payload, status, attempts, retry_policy, last_error,
                scheduled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.topic)
        .bind(&message.payload)
        .bind(message.status.as_str())
        .bind(attempts_to_i32(message.attempts))
        .bind(retry_policy)
        .bind(&message.last_error)
        .bind(message.scheduled_at)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

fn decode<T>(row: &PgRow) -> Result<T, StoreError>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    T::from_row(row).map_err(|e| StoreError::Corrupt(format!("failed to decode row: {e}")))
}

fn encode_json<T: serde::Serialize>(what: &str, value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("encode {what}: {e}")))
}

fn attempts_to_i32(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn decode_all<R, T>(rows: &[PgRow]) -> Result<Vec<T>, StoreError>
where
    R: for<'r> FromRow<'r, PgRow>,
    T: TryFrom<R, Error = StoreError>,
{
    rows.iter()
        .map(|r| decode::<R>(r).and_then(T::try_from))
        .collect()
}

#[async_trait::async_trait]
impl DispatchStore for PostgresDispatchStore {
    async fn begin(&self) -> Result<Box<dyn DispatchTx>, StoreError> {
        let tx = begin_with_lock_timeout(&self.pool, self.lock_timeout).await?;
        Ok(Box::new(PgDispatchTx { tx }))
    }

    #[instrument(skip(self), fields(request_id = %id), err)]
    async fn get_request(&self, id: RequestId) -> Result<Option<DemandRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM demand_requests WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_request", e))?;
        row.map(|r| decode::<RequestRow>(&r).and_then(DemandRequest::try_from))
            .transpose()
    }

    #[instrument(skip(self), fields(status = ?status, total = tracing::field::Empty), err)]
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        page: Pagination,
    ) -> Result<Page<DemandRequest>, StoreError> {
        let status = status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM demand_requests \
             WHERE deleted_at IS NULL AND ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_requests", e))?;
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM demand_requests \
             WHERE deleted_at IS NULL AND ($1::text IS NULL OR status = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_requests", e))?;
        Span::current().record("total", total);
        Ok(Page::new(
            decode_all::<RequestRow, _>(&rows)?,
            to_u64(total),
            page,
        ))
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_task(&self, id: TaskId) -> Result<Option<DispatchTask>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.map(|r| decode::<TaskRow>(&r).and_then(DispatchTask::try_from))
            .transpose()
    }

    async fn task_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE request_id = $1"
        ))
        .bind(request_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("task_for_request", e))?;
        row.map(|r| decode::<TaskRow>(&r).and_then(DispatchTask::try_from))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_tasks(&self, page: Pagination) -> Result<Page<DispatchTask>, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_tasks")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_tasks", e))?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM dispatch_tasks \
             ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;
        Ok(Page::new(decode_all::<TaskRow, _>(&rows)?, to_u64(total), page))
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn request_history(&self, request_id: RequestId) -> Result<Vec<DispatchLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, prev_status, curr_status, action, operator, remark, created_at
            FROM dispatch_logs
            WHERE request_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(request_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("request_history", e))?;
        decode_all::<LogRow, _>(&rows)
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Option<AllocationAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM allocation_attempts WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_attempt", e))?;
        row.map(|r| decode::<AttemptRow>(&r).and_then(AllocationAttempt::try_from))
            .transpose()
    }

    async fn attempts_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM allocation_attempts \
             WHERE request_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(request_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("attempts_for_request", e))?;
        decode_all::<AttemptRow, _>(&rows)
    }

    #[instrument(skip(self), fields(found = tracing::field::Empty), err)]
    async fn attempts_needing_attention(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM allocation_attempts \
             WHERE (status IN ('Requested', 'Locked') AND updated_at < $1) \
                OR (status = 'LockOrphaned' AND lock_released_at IS NULL) \
             ORDER BY updated_at ASC, id ASC"
        ))
        .bind(stale_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("attempts_needing_attention", e))?;
        let attempts = decode_all::<AttemptRow, _>(&rows)?;
        Span::current().record("found", attempts.len());
        Ok(attempts)
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresDispatchStore {
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let lease_until = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id FROM outbox_messages
                WHERE status NOT IN ('delivered', 'dead_lettered') AND scheduled_at <= $1
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages AS o
            SET status = 'in_flight',
                attempts = o.attempts + 1,
                scheduled_at = $3,
                updated_at = $1
            FROM due
            WHERE o.id = due.id
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(to_i64(limit as u64))
        .bind(lease_until)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;
        let mut messages = decode_all::<OutboxRow, OutboxMessage>(&rows)?;
        // RETURNING does not preserve the CTE order.
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Span::current().record("claimed", messages.len());
        Ok(messages)
    }

    #[instrument(skip(self, message), fields(outbox_id = %message.id, status = message.status.as_str()), err)]
    async fn save_outcome(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2, attempts = $3, last_error = $4, scheduled_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.status.as_str())
        .bind(attempts_to_i32(message.attempts))
        .bind(&message.last_error)
        .bind(message.scheduled_at)
        .bind(message.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_outcome", e))?;
        Ok(())
    }

    async fn outbox_messages(
        &self,
        status: Option<OutboxStatus>,
        page: Pagination,
    ) -> Result<Page<OutboxMessage>, StoreError> {
        let status = status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_messages WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_outbox", e))?;
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_at ASC, id ASC LIMIT $2 OFFSET $3"
        ))
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_messages", e))?;
        Ok(Page::new(
            decode_all::<OutboxRow, _>(&rows)?,
            to_u64(total),
            page,
        ))
    }
}

struct RequestRow {
    id: Uuid,
    material_id: Uuid,
    quantity: i64,
    urgency: String,
    target_area: String,
    description: String,
    status: String,
    audit_remark: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for RequestRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            material_id: row.try_get("material_id")?,
            quantity: row.try_get("quantity")?,
            urgency: row.try_get("urgency")?,
            target_area: row.try_get("target_area")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            audit_remark: row.try_get("audit_remark")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

fn parse_status(s: &str) -> Result<RequestStatus, StoreError> {
    RequestStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown request status '{s}'")))
}

impl TryFrom<RequestRow> for DemandRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let urgency = Urgency::parse(&row.urgency)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown urgency '{}'", row.urgency)))?;
        Ok(DemandRequest {
            id: RequestId::from_uuid(row.id),
            material_id: MaterialId::from_uuid(row.material_id),
            quantity: row.quantity,
            urgency,
            target_area: row.target_area,
            description: row.description,
            status: parse_status(&row.status)?,
            audit_remark: row.audit_remark,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

struct TaskRow {
    id: Uuid,
    request_id: Uuid,
    status: String,
    operator: String,
    logistics_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            status: row.try_get("status")?,
            operator: row.try_get("operator")?,
            logistics_ref: row.try_get("logistics_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for DispatchTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task status '{}'", row.status)))?;
        Ok(DispatchTask {
            id: TaskId::from_uuid(row.id),
            request_id: RequestId::from_uuid(row.request_id),
            status,
            operator: row.operator,
            logistics_ref: row.logistics_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct LogRow {
    id: Uuid,
    request_id: Uuid,
    prev_status: Option<String>,
    curr_status: String,
    action: String,
    operator: String,
    remark: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            prev_status: row.try_get("prev_status")?,
            curr_status: row.try_get("curr_status")?,
            action: row.try_get("action")?,
            operator: row.try_get("operator")?,
            remark: row.try_get("remark")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LogRow> for DispatchLog {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let action = LogAction::parse(&row.action)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log action '{}'", row.action)))?;
        Ok(DispatchLog {
            id: DispatchLogId::from_uuid(row.id),
            request_id: RequestId::from_uuid(row.request_id),
            prev_status: row.prev_status.as_deref().map(parse_status).transpose()?,
            curr_status: parse_status(&row.curr_status)?,
            action,
            operator: row.operator,
            remark: row.remark,
            created_at: row.created_at,
        })
    }
}

struct AttemptRow {
    id: Uuid,
    request_id: Uuid,
    items: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    lock_released_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for AttemptRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            items: row.try_get("items")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            lock_released_at: row.try_get("lock_released_at")?,
        })
    }
}

impl TryFrom<AttemptRow> for AllocationAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let items: Vec<LockItem> = serde_json::from_value(row.items)
            .map_err(|e| StoreError::Corrupt(format!("attempt {} items: {e}", row.id)))?;
        let status = AttemptStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt status '{}'", row.status)))?;
        Ok(AllocationAttempt {
            id: AttemptId::from_uuid(row.id),
            request_id: RequestId::from_uuid(row.request_id),
            items,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            lock_released_at: row.lock_released_at,
        })
    }
}

struct OutboxRow {
    id: Uuid,
    topic: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    retry_policy: serde_json::Value,
    last_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            retry_policy: row.try_get("retry_policy")?,
            last_error: row.try_get("last_error")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = OutboxStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown outbox status '{}'", row.status)))?;
        let retry_policy: RetryPolicy = serde_json::from_value(row.retry_policy)
            .map_err(|e| StoreError::Corrupt(format!("outbox {} retry policy: {e}", row.id)))?;
        Ok(OutboxMessage {
            id: OutboxId::from_uuid(row.id),
            topic: row.topic,
            payload: row.payload,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            retry_policy,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
