//! In-memory dispatch store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use supplyline_core::{AttemptId, Page, Pagination, RequestId, TaskId};
use supplyline_dispatch::{
    AllocationAttempt, DemandRequest, DispatchLog, DispatchTask, RequestStatus,
};

use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore};
use crate::store::row_lock::HeldLocks;
use crate::store::{RowLocks, StoreError};

use super::r#trait::{DispatchStore, DispatchTx};

#[derive(Debug, Default)]
struct DispatchState {
    requests: HashMap<RequestId, DemandRequest>,
    tasks: HashMap<TaskId, DispatchTask>,
    task_by_request: HashMap<RequestId, TaskId>,
    logs: Vec<DispatchLog>,
    attempts: HashMap<AttemptId, AllocationAttempt>,
    /// Insertion order is claim order.
    outbox: Vec<OutboxMessage>,
}

impl DispatchState {
    fn in_flight_for(&self, request_id: RequestId) -> impl Iterator<Item = &AllocationAttempt> {
        self.attempts
            .values()
            .filter(move |a| a.request_id == request_id && a.status.is_in_flight())
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryDispatchStore {
    state: Arc<RwLock<DispatchState>>,
    locks: Arc<LockTables>,
}

#[derive(Debug)]
struct LockTables {
    requests: RowLocks<RequestId>,
    tasks: RowLocks<TaskId>,
    attempts: RowLocks<AttemptId>,
}

impl InMemoryDispatchStore {
    pub fn new(row_lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(DispatchState::default())),
            locks: Arc::new(LockTables {
                requests: RowLocks::new(row_lock_timeout),
                tasks: RowLocks::new(row_lock_timeout),
                attempts: RowLocks::new(row_lock_timeout),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, DispatchState>, StoreError> {
        read_state(&self.state)
    }
}

impl Default for InMemoryDispatchStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn read_state(
    state: &RwLock<DispatchState>,
) -> Result<RwLockReadGuard<'_, DispatchState>, StoreError> {
    state
        .read()
        .map_err(|_| StoreError::Backend("dispatch state lock poisoned".to_string()))
}

fn write_state(
    state: &RwLock<DispatchState>,
) -> Result<RwLockWriteGuard<'_, DispatchState>, StoreError> {
    state
        .write()
        .map_err(|_| StoreError::Backend("dispatch state lock poisoned".to_string()))
}

struct InMemoryDispatchTx {
    state: Arc<RwLock<DispatchState>>,
    locks: Arc<LockTables>,
    held_requests: HeldLocks<RequestId>,
    held_tasks: HeldLocks<TaskId>,
    held_attempts: HeldLocks<AttemptId>,
    requests: HashMap<RequestId, DemandRequest>,
    logs: Vec<DispatchLog>,
    tasks: HashMap<TaskId, DispatchTask>,
    /// `None` marks a deletion.
    attempts: HashMap<AttemptId, Option<AllocationAttempt>>,
    outbox: Vec<OutboxMessage>,
}

impl InMemoryDispatchTx {
    fn request_exists(&self, id: RequestId) -> Result<bool, StoreError> {
        Ok(self.requests.contains_key(&id) || read_state(&self.state)?.requests.contains_key(&id))
    }

    fn staged_task_for(&self, request_id: RequestId) -> Option<&DispatchTask> {
        self.tasks.values().find(|t| t.request_id == request_id)
    }

    fn committed_task_id_for(&self, request_id: RequestId) -> Result<Option<TaskId>, StoreError> {
        Ok(read_state(&self.state)?
            .task_by_request
            .get(&request_id)
            .copied())
    }
}

#[async_trait::async_trait]
impl DispatchTx for InMemoryDispatchTx {
    async fn request_for_update(
        &mut self,
        id: RequestId,
    ) -> Result<Option<DemandRequest>, StoreError> {
        self.held_requests.lock(&self.locks.requests, &id).await?;
        if let Some(request) = self.requests.get(&id) {
            return Ok(Some(request.clone()));
        }
        Ok(read_state(&self.state)?.requests.get(&id).cloned())
    }

    async fn insert_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
        if self.request_exists(request.id)? {
            return Err(StoreError::Constraint(format!(
                "demand request {} already exists",
                request.id
            )));
        }
        self.held_requests
            .lock(&self.locks.requests, &request.id)
            .await?;
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn update_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
        if !self.held_requests.holds(&request.id) {
            return Err(StoreError::Backend(format!(
                "request {} written without its row lock",
                request.id
            )));
        }
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn append_log(&mut self, log: &DispatchLog) -> Result<(), StoreError> {
        if !self.request_exists(log.request_id)? {
            return Err(StoreError::Constraint(format!(
                "log entry references unknown request {}",
                log.request_id
            )));
        }
        self.logs.push(log.clone());
        Ok(())
    }

    async fn insert_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
        if self.staged_task_for(task.request_id).is_some()
            || self.committed_task_id_for(task.request_id)?.is_some()
        {
            return Err(StoreError::Constraint(format!(
                "request {} already has a dispatch task",
                task.request_id
            )));
        }
        if !self.request_exists(task.request_id)? {
            return Err(StoreError::Constraint(format!(
                "task references unknown request {}",
                task.request_id
            )));
        }
        self.held_tasks.lock(&self.locks.tasks, &task.id).await?;
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn task_for_request_for_update(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError> {
        if let Some(task) = self.staged_task_for(request_id) {
            return Ok(Some(task.clone()));
        }
        let Some(task_id) = self.committed_task_id_for(request_id)? else {
            return Ok(None);
        };
        self.held_tasks.lock(&self.locks.tasks, &task_id).await?;
        Ok(read_state(&self.state)?.tasks.get(&task_id).cloned())
    }

    async fn update_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
        if !self.held_tasks.holds(&task.id) {
            return Err(StoreError::Backend(format!(
                "task {} written without its row lock",
                task.id
            )));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn attempt_for_update(
        &mut self,
        id: AttemptId,
    ) -> Result<Option<AllocationAttempt>, StoreError> {
        self.held_attempts.lock(&self.locks.attempts, &id).await?;
        if let Some(staged) = self.attempts.get(&id) {
            return Ok(staged.clone());
        }
        Ok(read_state(&self.state)?.attempts.get(&id).cloned())
    }

    async fn in_flight_attempt(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<AllocationAttempt>, StoreError> {
        let staged = self.attempts.values().flatten().find(|a| {
            a.request_id == request_id && a.status.is_in_flight()
        });
        if let Some(attempt) = staged {
            return Ok(Some(attempt.clone()));
        }
        let state = read_state(&self.state)?;
        Ok(state
            .in_flight_for(request_id)
            // A staged write overrides the committed row.
            .find(|a| !self.attempts.contains_key(&a.id))
            .cloned())
    }

    async fn insert_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
        if attempt.status.is_in_flight()
            && self.in_flight_attempt(attempt.request_id).await?.is_some()
        {
            return Err(StoreError::Constraint(format!(
                "request {} already has an in-flight allocation attempt",
                attempt.request_id
            )));
        }
        self.held_attempts
            .lock(&self.locks.attempts, &attempt.id)
            .await?;
        self.attempts.insert(attempt.id, Some(attempt.clone()));
        Ok(())
    }

    async fn update_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
        if !self.held_attempts.holds(&attempt.id) {
            return Err(StoreError::Backend(format!(
                "attempt {} written without its row lock",
                attempt.id
            )));
        }
        self.attempts.insert(attempt.id, Some(attempt.clone()));
        Ok(())
    }

    async fn delete_attempt(&mut self, id: AttemptId) -> Result<(), StoreError> {
        if !self.held_attempts.holds(&id) {
            return Err(StoreError::Backend(format!(
                "attempt {id} deleted without its row lock"
            )));
        }
        self.attempts.insert(id, None);
        Ok(())
    }

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.outbox.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = *self;
        let mut state = write_state(&tx.state)?;

        // Mirror the one-task-per-request and one-in-flight-attempt indexes.
        for task in tx.tasks.values() {
            if let Some(existing) = state.task_by_request.get(&task.request_id) {
                if *existing != task.id {
                    return Err(StoreError::Constraint(format!(
                        "request {} already has a dispatch task",
                        task.request_id
                    )));
                }
            }
        }
        for attempt in tx.attempts.values().flatten() {
            if !attempt.status.is_in_flight() {
                continue;
            }
            let clash = state
                .in_flight_for(attempt.request_id)
                .any(|other| other.id != attempt.id && !tx.attempts.contains_key(&other.id));
            if clash {
                return Err(StoreError::Constraint(format!(
                    "request {} already has an in-flight allocation attempt",
                    attempt.request_id
                )));
            }
        }

        for (id, request) in tx.requests {
            state.requests.insert(id, request);
        }
        state.logs.extend(tx.logs);
        for (id, task) in tx.tasks {
            state.task_by_request.insert(task.request_id, id);
            state.tasks.insert(id, task);
        }
        for (id, attempt) in tx.attempts {
            match attempt {
                Some(attempt) => {
                    state.attempts.insert(id, attempt);
                }
                None => {
                    state.attempts.remove(&id);
                }
            }
        }
        state.outbox.extend(tx.outbox);
        drop(state);
        Ok(())
    }
}

#[async_trait::async_trait]
impl DispatchStore for InMemoryDispatchStore {
    async fn begin(&self) -> Result<Box<dyn DispatchTx>, StoreError> {
        Ok(Box::new(InMemoryDispatchTx {
            state: self.state.clone(),
            locks: self.locks.clone(),
            held_requests: HeldLocks::default(),
            held_tasks: HeldLocks::default(),
            held_attempts: HeldLocks::default(),
            requests: HashMap::new(),
            logs: Vec::new(),
            tasks: HashMap::new(),
            attempts: HashMap::new(),
            outbox: Vec::new(),
        }))
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<DemandRequest>, StoreError> {
        Ok(self
            .read()?
            .requests
            .get(&id)
            .filter(|r| !r.is_removed())
            .cloned())
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        page: Pagination,
    ) -> Result<Page<DemandRequest>, StoreError> {
        let state = self.read()?;
        let mut items: Vec<DemandRequest> = state
            .requests
            .values()
            .filter(|r| !r.is_removed())
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(Page::new(page.slice(&items), items.len() as u64, page))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<DispatchTask>, StoreError> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn task_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DispatchTask>, StoreError> {
        let state = self.read()?;
        Ok(state
            .task_by_request
            .get(&request_id)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn list_tasks(&self, page: Pagination) -> Result<Page<DispatchTask>, StoreError> {
        let state = self.read()?;
        let mut items: Vec<DispatchTask> = state.tasks.values().cloned().collect();
        items.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(Page::new(page.slice(&items), items.len() as u64, page))
    }

    async fn request_history(&self, request_id: RequestId) -> Result<Vec<DispatchLog>, StoreError> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|l| l.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Option<AllocationAttempt>, StoreError> {
        Ok(self.read()?.attempts.get(&id).cloned())
    }

    async fn attempts_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        let state = self.read()?;
        let mut items: Vec<AllocationAttempt> = state
            .attempts
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(items)
    }

    async fn attempts_needing_attention(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<AllocationAttempt>, StoreError> {
        let state = self.read()?;
        let mut items: Vec<AllocationAttempt> = state
            .attempts
            .values()
            .filter(|a| {
                (a.status.is_in_flight() && a.updated_at < stale_before) || a.needs_release()
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.updated_at, a.id).cmp(&(b.updated_at, b.id)));
        Ok(items)
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryDispatchStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut state = write_state(&self.state)?;
        let mut claimed = Vec::new();
        for message in state.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if message.is_claimable(now) {
                message.claim(now, lease);
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn save_outcome(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        let mut state = write_state(&self.state)?;
        let slot = state
            .outbox
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::Backend(format!("outbox message {} vanished", message.id)))?;
        *slot = message.clone();
        Ok(())
    }

    async fn outbox_messages(
        &self,
        status: Option<OutboxStatus>,
        page: Pagination,
    ) -> Result<Page<OutboxMessage>, StoreError> {
        let state = self.read()?;
        let items: Vec<OutboxMessage> = state
            .outbox
            .iter()
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect();
        Ok(Page::new(page.slice(&items), items.len() as u64, page))
    }
}
