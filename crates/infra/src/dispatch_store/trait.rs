use std::sync::Arc;

use chrono::{DateTime, Utc};

use supplyline_core::{AttemptId, Page, Pagination, RequestId, TaskId};
use supplyline_dispatch::{AllocationAttempt, DemandRequest, DispatchLog, DispatchTask, RequestStatus};

use crate::outbox::OutboxMessage;
use crate::store::StoreError;

/// One dispatch unit of work.
///
/// Lock order is request, then task, then attempt. Nothing written here is
/// visible to other readers before `commit`.
#[async_trait::async_trait]
pub trait DispatchTx: Send {
    /// Lock and load a request, removed ones included.
    async fn request_for_update(
        &mut self,
        id: RequestId,
    ) -> Result<Option<DemandRequest>, StoreError>;

    async fn insert_request(&mut self, request: &DemandRequest) -> Result<(), StoreError>;

    async fn update_request(&mut self, request: &DemandRequest) -> Result<(), StoreError>;

    async fn append_log(&mut self, log: &DispatchLog) -> Result<(), StoreError>;

    /// Fails with `Constraint` if the request already has a task.
    async fn insert_task(&mut self, task: &DispatchTask) -> Result<(), StoreError>;

    async fn task_for_request_for_update(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError>;

    async fn update_task(&mut self, task: &DispatchTask) -> Result<(), StoreError>;

    async fn attempt_for_update(
        &mut self,
        id: AttemptId,
    ) -> Result<Option<AllocationAttempt>, StoreError>;

    /// The request's `Requested`/`Locked` attempt, if any. Callers hold the
    /// request lock.
    async fn in_flight_attempt(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<AllocationAttempt>, StoreError>;

    /// Fails with `Constraint` if the request already has an in-flight attempt.
    async fn insert_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError>;

    async fn update_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError>;

    async fn delete_attempt(&mut self, id: AttemptId) -> Result<(), StoreError>;

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait DispatchStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn DispatchTx>, StoreError>;

    /// Live (not removed) request.
    async fn get_request(&self, id: RequestId) -> Result<Option<DemandRequest>, StoreError>;

    /// Live requests, newest first, optionally filtered by status.
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        page: Pagination,
    ) -> Result<Page<DemandRequest>, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<DispatchTask>, StoreError>;

    async fn task_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError>;

    /// Newest first.
    async fn list_tasks(&self, page: Pagination) -> Result<Page<DispatchTask>, StoreError>;

    /// Log entries of one request, oldest first.
    async fn request_history(&self, request_id: RequestId) -> Result<Vec<DispatchLog>, StoreError>;

    async fn get_attempt(&self, id: AttemptId) -> Result<Option<AllocationAttempt>, StoreError>;

    async fn attempts_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<AllocationAttempt>, StoreError>;

    /// In-flight attempts last touched before `stale_before`, plus orphaned
    /// attempts whose lock release is unconfirmed. Oldest first.
    async fn attempts_needing_attention(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AllocationAttempt>, StoreError>;
}

#[async_trait::async_trait]
impl<S> DispatchStore for Arc<S>
where
    S: DispatchStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn DispatchTx>, StoreError> {
        (**self).begin().await
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<DemandRequest>, StoreError> {
        (**self).get_request(id).await
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        page: Pagination,
    ) -> Result<Page<DemandRequest>, StoreError> {
        (**self).list_requests(status, page).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<DispatchTask>, StoreError> {
        (**self).get_task(id).await
    }

    async fn task_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError> {
        (**self).task_for_request(request_id).await
    }

    async fn list_tasks(&self, page: Pagination) -> Result<Page<DispatchTask>, StoreError> {
        (**self).list_tasks(page).await
    }

    async fn request_history(&self, request_id: RequestId) -> Result<Vec<DispatchLog>, StoreError> {
        (**self).request_history(request_id).await
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Option<AllocationAttempt>, StoreError> {
        (**self).get_attempt(id).await
    }

    async fn attempts_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        (**self).attempts_for_request(request_id).await
    }

    async fn attempts_needing_attention(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        (**self).attempts_needing_attention(stale_before).await
    }
}
